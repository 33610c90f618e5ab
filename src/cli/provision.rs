use anyhow::Result;

use crate::config::DeckhandConfig;
use crate::nginx::Proxy;
use crate::stage::Plan;
use crate::system::{Identity, Packages};
use crate::systemd::{Jobs, Supervision};
use crate::tls::BootstrapCertificate;

pub fn plan(common_name: Option<String>) -> Plan {
    Plan::new("provision")
        .stage(Packages)
        .stage(Identity)
        .stage(BootstrapCertificate { common_name })
        .stage(Proxy)
        .stage(Supervision)
        .stage(Jobs)
}

pub async fn run(config: DeckhandConfig, common_name: Option<String>, dry_run: bool) -> Result<()> {
    super::execute(config, plan(common_name), dry_run).await?;
    if !dry_run {
        crate::output::info("Next: `deckhand secrets`, then `deckhand bootstrap-database` and `deckhand deploy`");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal;
    use crate::ssh::fake::FakeHost;
    use crate::stage::{Context, Executor, StageId, StageOutcome};

    /// Host on which each stage's check fails once, as on a fresh machine
    fn fresh_host() -> FakeHost {
        let host = FakeHost::new();
        host.fail_once("dpkg -s");
        host.fail_once("id -nG www-data");
        host.fail_once("test -s /etc/stockwars/tls/bootstrap.key");
        host.fail_once("test -e /etc/systemd/system/stockwars.service");
        host.fail_once("test -f /etc/systemd/system/stockwars-fetch-quotes.service");
        host
    }

    #[tokio::test]
    async fn second_provision_changes_nothing() {
        let host = fresh_host();
        let ctx = Context::new(minimal(), &host);
        let plan = plan(None);

        let first = Executor::new(&ctx, false).run(&plan).await.unwrap();
        assert!(first.iter().all(|(_, o)| *o == StageOutcome::Applied), "{:?}", first);

        host.clear_history();
        let second = Executor::new(&ctx, false).run(&plan).await.unwrap();
        assert!(
            second.iter().all(|(_, o)| *o == StageOutcome::AlreadySatisfied),
            "{:?}",
            second
        );
        assert!(!host.ran("apt-get install"));
        assert!(!host.ran("openssl req"));
        assert!(!host.ran("systemctl reload nginx"));
        assert!(!host.ran("systemctl enable"));
    }

    #[test]
    fn stages_run_in_dependency_order() {
        assert_eq!(
            plan(None).ids(),
            vec![
                StageId::Packages,
                StageId::Identity,
                StageId::Certificate,
                StageId::Proxy,
                StageId::Supervision,
                StageId::Jobs,
            ]
        );
    }
}
