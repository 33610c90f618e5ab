use super::DeckhandConfig;

/// Where everything lives on the host. Derived once from the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub app: String,
    pub service_user: String,
    pub base: String,
    pub code: String,
    pub venv: String,
    pub static_root: String,
    pub media_root: String,
    pub runtime_dir: String,
    pub socket: String,
    pub env_dir: String,
    pub env_file: String,
    pub tls_dir: String,
    pub proxy_available: String,
    pub proxy_enabled: String,
    pub unit: String,
    pub record: String,
}

impl Layout {
    pub fn new(config: &DeckhandConfig) -> Self {
        let app = config.app.name.clone();
        let base = config
            .paths
            .base
            .clone()
            .unwrap_or_else(|| format!("/srv/{}", app));
        let env_dir = config
            .paths
            .env_dir
            .clone()
            .unwrap_or_else(|| format!("/etc/{}", app));

        Self {
            service_user: config.service_user().to_string(),
            code: format!("{}/app", base),
            venv: format!("{}/venv", base),
            static_root: format!("{}/static", base),
            media_root: format!("{}/media", base),
            runtime_dir: app.clone(),
            socket: format!("/run/{}/app.sock", app),
            env_file: format!("{}/{}.env", env_dir, app),
            tls_dir: format!("{}/tls", env_dir),
            proxy_available: format!("/etc/nginx/sites-available/{}", app),
            proxy_enabled: format!("/etc/nginx/sites-enabled/{}", app),
            unit: format!("/etc/systemd/system/{}.service", app),
            record: format!("{}/deploy.json", base),
            env_dir,
            base,
            app,
        }
    }

    pub fn service_name(&self) -> String {
        format!("{}.service", self.app)
    }

    pub fn bootstrap_key(&self) -> String {
        format!("{}/bootstrap.key", self.tls_dir)
    }

    pub fn bootstrap_cert(&self) -> String {
        format!("{}/bootstrap.crt", self.tls_dir)
    }

    /// Staging tree an archive is unpacked into before it replaces `code`
    pub fn code_next(&self) -> String {
        format!("{}.next", self.code)
    }

    pub fn code_prev(&self) -> String {
        format!("{}.prev", self.code)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::tests::minimal;

    #[test]
    fn defaults_derive_from_app_name() {
        let layout = minimal().layout();
        assert_eq!(layout.base, "/srv/stockwars");
        assert_eq!(layout.code, "/srv/stockwars/app");
        assert_eq!(layout.socket, "/run/stockwars/app.sock");
        assert_eq!(layout.env_file, "/etc/stockwars/stockwars.env");
        assert_eq!(layout.tls_dir, "/etc/stockwars/tls");
        assert_eq!(layout.proxy_available, "/etc/nginx/sites-available/stockwars");
        assert_eq!(layout.unit, "/etc/systemd/system/stockwars.service");
    }

    #[test]
    fn base_override_moves_code_tree() {
        let mut config = minimal();
        config.paths.base = Some("/opt/sw".into());
        let layout = config.layout();
        assert_eq!(layout.code, "/opt/sw/app");
        assert_eq!(layout.venv, "/opt/sw/venv");
        assert_eq!(layout.code_next(), "/opt/sw/app.next");
    }
}
