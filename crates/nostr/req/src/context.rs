//! Everything a run needs besides the filter: how to reach relays, whether and how to
//! authenticate.

use crate::cli::Args;
use crate::config::ReqConfig;
use anyhow::Context;
use nostr::{BunkerUrl, parse_secret_key};
use nostr_client::{AuthPolicy, BunkerSigner, Connector, LocalSigner, RelayConfig, Signer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Secret used for NIP-42 when `--auth` is given without a key.
pub const DEFAULT_SECRET_KEY: &str = "0000000000000000000000000000000000000000000000000000000000000001";

/// Built once per invocation and shared by every input line.
pub struct ReqContext {
    pub connector: Arc<dyn Connector>,
    pub relay_config: RelayConfig,
    pub auth_policy: AuthPolicy,
    /// `None` unless authentication is enabled.
    pub signer: Option<Arc<dyn Signer>>,
}

impl ReqContext {
    /// Resolve the signing path. Keys are decoded here, so a bad key fails the
    /// invocation before any relay is contacted.
    pub fn new(
        args: &Args,
        config: &ReqConfig,
        connector: Arc<dyn Connector>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Self> {
        let auth_policy = args.auth_policy();
        let relay_config = config.relay_config();
        let signer = if auth_policy == AuthPolicy::Disabled {
            None
        } else {
            Some(build_signer(args, config, connector.clone(), relay_config.clone(), cancel)?)
        };

        Ok(Self {
            connector,
            relay_config,
            auth_policy,
            signer,
        })
    }
}

fn build_signer(
    args: &Args,
    config: &ReqConfig,
    connector: Arc<dyn Connector>,
    relay_config: RelayConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<Arc<dyn Signer>> {
    if let Some(connect) = &args.connect {
        let bunker = BunkerUrl::parse(connect).context("invalid --connect address")?;
        let client_secret = args
            .connect_as
            .as_deref()
            .map(parse_secret_key)
            .transpose()
            .context("invalid --connect-as key")?;
        let signer = BunkerSigner::new(
            bunker,
            client_secret,
            connector,
            relay_config,
            config.bunker_timeout(),
            cancel.child_token(),
        )?;
        info!("Using remote signer {} as {}", signer.bunker().remote_pubkey, signer.client_pubkey());
        return Ok(Arc::new(signer));
    }

    let secret = if args.prompt_sec {
        rpassword::prompt_password("type your secret key as nsec or hex: ")
            .context("reading secret key")?
    } else {
        args.sec.clone().unwrap_or_else(|| DEFAULT_SECRET_KEY.to_string())
    };
    let signer = LocalSigner::from_str_key(secret.trim()).context("invalid secret key")?;
    Ok(Arc::new(signer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_client::WebSocketConnector;

    fn context(args: Args) -> anyhow::Result<ReqContext> {
        ReqContext::new(
            &args,
            &ReqConfig::default(),
            Arc::new(WebSocketConnector::new()),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_no_signer_without_auth() {
        let ctx = context(Args {
            sec: Some("not a key".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(ctx.auth_policy, AuthPolicy::Disabled);
        assert!(ctx.signer.is_none());
    }

    #[tokio::test]
    async fn test_default_key_signs() {
        let ctx = context(Args {
            auth: true,
            ..Default::default()
        })
        .unwrap();
        let signer = ctx.signer.unwrap();
        assert_eq!(
            signer.public_key().await.unwrap(),
            "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
        );
    }

    #[test]
    fn test_bad_keys_fail_setup() {
        assert!(context(Args {
            auth: true,
            sec: Some("deadbeef".to_string()),
            ..Default::default()
        })
        .is_err());
        assert!(context(Args {
            auth: true,
            connect: Some("https://example.com".to_string()),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_bunker_signer_is_lazy() {
        let ctx = context(Args {
            force_pre_auth: true,
            connect: Some(
                "bunker://79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798?relay=wss://bunker.example.com"
                    .to_string(),
            ),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(ctx.auth_policy, AuthPolicy::Proactive);
        assert!(ctx.signer.is_some());
    }
}
