use std::fmt;

use anyhow::{bail, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::DeckhandConfig;
use crate::database;

use super::prompt::SecretSource;

pub const SECRET_KEY: &str = "DJANGO_SECRET_KEY";
pub const DEBUG: &str = "DJANGO_DEBUG";
pub const ALLOWED_HOSTS: &str = "DJANGO_ALLOWED_HOSTS";
pub const DB_NAME: &str = "POSTGRES_DB";
pub const DB_USER: &str = "POSTGRES_USER";
pub const DB_PASSWORD: &str = "POSTGRES_PASSWORD";
pub const DB_HOST: &str = "POSTGRES_HOST";
pub const DB_PORT: &str = "POSTGRES_PORT";
pub const CONN_MAX_AGE: &str = "CONN_MAX_AGE";
pub const API_KEY: &str = "TWELVE_DATA_API_KEY";
pub const MAX_QUOTE_AGE: &str = "MAX_QUOTE_AGE_SECONDS";

/// File order of the bundle
pub const KEYS: [&str; 11] = [
    SECRET_KEY,
    DEBUG,
    ALLOWED_HOSTS,
    DB_NAME,
    DB_USER,
    DB_PASSWORD,
    DB_HOST,
    DB_PORT,
    CONN_MAX_AGE,
    API_KEY,
    MAX_QUOTE_AGE,
];

const SECRET_KEY_LEN: usize = 50;
const PASSWORD_LEN: usize = 32;

/// Random token over the URL-safe base64 alphabet `[A-Za-z0-9_-]`
pub fn generate_token(len: usize) -> String {
    let mut bytes = vec![0u8; len * 3 / 4 + 3];
    OsRng.fill_bytes(&mut bytes);
    let mut token = URL_SAFE_NO_PAD.encode(&bytes);
    token.truncate(len);
    token
}

/// Runtime configuration for the application, in file order. `Debug` never
/// shows values.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBundle {
    entries: Vec<(String, String)>,
}

impl SecretBundle {
    /// Generate what can be generated and ask for the rest
    pub fn assemble(config: &DeckhandConfig, source: &mut dyn SecretSource) -> Result<Self> {
        let db = &config.database;

        let db_host = match &db.host {
            Some(host) => host.clone(),
            None => source.text("Database host", Some("localhost"))?,
        };
        let local_db = database::is_local(&db_host);

        let db_password = if local_db {
            generate_token(PASSWORD_LEN)
        } else {
            source.password(&format!("Password for database user {}", db.user))?
        };

        let allowed_hosts = if config.secrets.allowed_hosts.is_empty() {
            let default = config
                .tls
                .common_name
                .clone()
                .unwrap_or_else(|| config.host.address.clone());
            source.text("Allowed hosts (comma separated)", Some(&default))?
        } else {
            config.secrets.allowed_hosts.join(",")
        };

        let api_key = source.password("Twelve Data API key")?;

        let entries = vec![
            (SECRET_KEY, generate_token(SECRET_KEY_LEN)),
            (DEBUG, if config.secrets.debug { "True" } else { "False" }.to_string()),
            (ALLOWED_HOSTS, normalize_hosts(&allowed_hosts)),
            (DB_NAME, db.name.clone()),
            (DB_USER, db.user.clone()),
            (DB_PASSWORD, db_password),
            (DB_HOST, db_host),
            (DB_PORT, db.port.to_string()),
            (CONN_MAX_AGE, db.conn_max_age.to_string()),
            (API_KEY, api_key),
            (MAX_QUOTE_AGE, config.secrets.max_quote_age_seconds.to_string()),
        ];

        Self::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn new(entries: Vec<(String, String)>) -> Result<Self> {
        for (key, value) in &entries {
            if value.contains('\n') || value.contains('\r') {
                bail!("{} contains a line break", key);
            }
            if value.trim() != value {
                bail!("{} has leading or trailing whitespace", key);
            }
            if value.is_empty() && key != ALLOWED_HOSTS {
                bail!("{} cannot be empty", key);
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// `KEY=value` lines, as read by systemd `EnvironmentFile=` and `set -a; .`
    pub fn render(&self) -> String {
        let mut out = String::from("# Managed by deckhand. Owner read/write only.\n");
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(&quote_value(value));
            out.push('\n');
        }
        out
    }

    /// SHA-256 of the rendered file, safe to log
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.render().as_bytes()))
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, _)| (k, "***")))
            .finish()
    }
}

fn normalize_hosts(raw: &str) -> String {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|h| !h.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Values that both systemd and bash read the same way unquoted are written
/// bare; anything else is single-quoted.
fn quote_value(value: &str) -> String {
    let bare = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-.,:/@+=".contains(c));
    if bare {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal;
    use crate::secrets::prompt::Scripted;

    #[test]
    fn tokens_use_the_url_safe_alphabet() {
        for len in [12, 32, 50] {
            let token = generate_token(len);
            assert_eq!(token.len(), len);
            assert!(token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
        assert_ne!(generate_token(32), generate_token(32));
    }

    #[test]
    fn local_database_gets_a_generated_password() {
        let mut config = minimal();
        config.database.host = Some("localhost".into());
        config.secrets.allowed_hosts = vec!["stockwars.example".into()];
        let mut source = Scripted::new(&["tdkey-123"]);

        let bundle = SecretBundle::assemble(&config, &mut source).unwrap();

        assert_eq!(bundle.keys().collect::<Vec<_>>(), KEYS.to_vec());
        assert_eq!(bundle.get(DB_PASSWORD).unwrap().len(), 32);
        assert_eq!(bundle.get(SECRET_KEY).unwrap().len(), 50);
        assert_eq!(bundle.get(API_KEY), Some("tdkey-123"));
        assert_eq!(bundle.get(DEBUG), Some("False"));
        assert_eq!(bundle.get(MAX_QUOTE_AGE), Some("300"));
        assert!(source.is_exhausted());
    }

    #[test]
    fn external_database_asks_for_host_and_password() {
        let mut config = minimal();
        config.secrets.allowed_hosts = vec!["a.example".into(), "b.example".into()];
        let mut source = Scripted::new(&["db.managed.example", "s3cret pass", "tdkey"]);

        let bundle = SecretBundle::assemble(&config, &mut source).unwrap();

        assert_eq!(bundle.get(DB_HOST), Some("db.managed.example"));
        assert_eq!(bundle.get(DB_PASSWORD), Some("s3cret pass"));
        assert_eq!(bundle.get(ALLOWED_HOSTS), Some("a.example,b.example"));
    }

    #[test]
    fn render_quotes_only_when_needed() {
        let bundle = SecretBundle::new(vec![
            ("PLAIN".into(), "abc-123_x".into()),
            ("SPACED".into(), "it's here".into()),
        ])
        .unwrap();
        let rendered = bundle.render();
        assert!(rendered.contains("\nPLAIN=abc-123_x\n"));
        assert!(rendered.contains("\nSPACED='it'\\''s here'\n"));
    }

    #[test]
    fn debug_output_hides_values() {
        let bundle = SecretBundle::new(vec![(DB_PASSWORD.into(), "hunter2".into())]).unwrap();
        let shown = format!("{:?}", bundle);
        assert!(shown.contains(DB_PASSWORD));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn line_breaks_are_rejected() {
        let err = SecretBundle::new(vec![(API_KEY.into(), "abc\nEVIL=1".into())]).unwrap_err();
        assert!(err.to_string().contains("line break"));
    }
}
