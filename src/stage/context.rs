use crate::config::{DeckhandConfig, Layout};
use crate::ssh::Remote;

/// Everything a stage needs: the validated config, the derived remote layout,
/// and the connection. Built once per operation.
pub struct Context<'a> {
    pub config: DeckhandConfig,
    pub layout: Layout,
    pub remote: &'a dyn Remote,
}

impl<'a> Context<'a> {
    pub fn new(config: DeckhandConfig, remote: &'a dyn Remote) -> Self {
        let layout = config.layout();
        Self {
            config,
            layout,
            remote,
        }
    }

    pub fn service_user(&self) -> &str {
        &self.layout.service_user
    }

    /// Command running `manage.py` from `workdir` as the service identity
    /// with the secret bundle exported. Meant for `sudo_exec`.
    pub fn manage_py(&self, workdir: &str, args: &str) -> String {
        format!(
            "cd {work} && set -a && . {env} && set +a && \
             export DJANGO_STATIC_ROOT={static_root} DJANGO_MEDIA_ROOT={media_root} && \
             runuser -u {user} -- {venv}/bin/python manage.py {args}",
            work = workdir,
            env = self.layout.env_file,
            static_root = self.layout.static_root,
            media_root = self.layout.media_root,
            user = self.layout.service_user,
            venv = self.layout.venv,
            args = args
        )
    }
}
