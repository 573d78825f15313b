//! The `req` command: build a filter per input line, then print it or query relays.

use crate::cli::Args;
use crate::config::ReqConfig;
use crate::context::ReqContext;
use crate::input::InputLines;
use crate::output::Output;
use anyhow::Context;
use futures::StreamExt;
use nostr_client::{ClientError, DeliveryMode, FilterBuilder, RelayPool, WebSocketConnector};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Some input line failed, or setup failed.
pub const EXIT_FAILURE: u8 = 1;
/// None of the given relays could be reached.
pub const EXIT_NO_RELAYS: u8 = 3;

/// Counts of processed input lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Report {
    pub lines: usize,
    pub failed: usize,
}

impl Report {
    pub fn exit_code(&self) -> ExitCode {
        if self.failed > 0 {
            ExitCode::from(EXIT_FAILURE)
        } else {
            ExitCode::SUCCESS
        }
    }
}

/// Exit code for an error that ended the run early.
pub fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<ClientError>() {
        Some(ClientError::NoRelaysConnected) => ExitCode::from(EXIT_NO_RELAYS),
        _ => ExitCode::from(EXIT_FAILURE),
    }
}

/// Run with real stdin, stdout and WebSocket relays.
pub async fn execute(args: Args, cancel: CancellationToken) -> anyhow::Result<ExitCode> {
    let config = ReqConfig::load(args.config.as_deref())?;
    let ctx = ReqContext::new(&args, &config, Arc::new(WebSocketConnector::new()), &cancel)?;
    let mut output = Output::new(std::io::stdout().lock());
    let report = run(&args, &config, &ctx, InputLines::stdin(), &mut output, &cancel).await?;
    Ok(report.exit_code())
}

/// Process every input line in order.
///
/// A line whose filter cannot be built is logged and counted; the remaining lines
/// still run. Connecting to zero relays ends the run with
/// [`ClientError::NoRelaysConnected`].
pub async fn run<R, W>(
    args: &Args,
    config: &ReqConfig,
    ctx: &ReqContext,
    mut input: InputLines<R>,
    output: &mut Output<W>,
    cancel: &CancellationToken,
) -> anyhow::Result<Report>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let overrides = args.filter_overrides().context("invalid tag flag")?;
    let builder = FilterBuilder::new(overrides);
    let mode = args.delivery_mode(config);

    let pool = if args.relays.is_empty() {
        None
    } else {
        let (pool, _) = RelayPool::connect(
            &args.relays,
            ctx.connector.clone(),
            ctx.auth_policy,
            ctx.signer.clone(),
            ctx.relay_config.clone(),
            cancel,
        )
        .await?;
        Some(pool)
    };

    let mut report = Report::default();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Interrupted while reading input");
                break;
            }
            line = input.next_line() => line.context("reading standard input")?,
        };
        let Some(line) = line else { break };
        report.lines += 1;

        let filter = match builder.build_line(&line) {
            Ok(filter) => filter,
            Err(e) => {
                error!("Invalid filter on line {}: {}", report.lines, e);
                report.failed += 1;
                continue;
            }
        };

        match &pool {
            None => output.filter(&filter, args.bare, &config.subscription_id)?,
            Some(pool) => {
                let delivered = query(pool, filter, &mode, output, cancel).await?;
                debug!("Line {} delivered {} events", report.lines, delivered);
            }
        }
    }

    if let Some(pool) = pool {
        pool.close().await;
    }
    if report.failed > 0 {
        warn!("{} of {} input lines failed", report.failed, report.lines);
    }
    Ok(report)
}

async fn query<W: Write>(
    pool: &RelayPool,
    filter: nostr_client::Filter,
    mode: &DeliveryMode,
    output: &mut Output<W>,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    info!("Requesting {} from {} relays", filter, pool.len());
    let mut events = pool.subscribe(filter, mode.clone(), cancel.child_token());
    let mut delivered = 0;
    while let Some(item) = events.next().await {
        output.event(&item.event)?;
        delivered += 1;
    }
    Ok(delivered)
}
