//! Demonstration stdin ingress (§AMBIENT.5). Not a protocol: a thin stand-in
//! for the HTTP front door named as an external collaborator in the
//! Non-goals, existing only so the binary has something to call `enqueue`
//! with.

use crate::engine::DispatchEngine;
use crate::freshness::FreshnessSource;
use crate::store::StoreGateway;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

/// Read `<due_time_ms>\t<text>` lines from `reader` until EOF, calling
/// `engine.enqueue` for each well-formed one. Malformed lines are logged
/// and skipped; they never terminate the task (§8, ambient-stack-specific
/// properties).
pub async fn run_stdin_ingress<S, R>(engine: Arc<DispatchEngine<S>>, reader: R)
where
    S: StoreGateway + FreshnessSource + 'static,
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "stdin ingress read error, stopping");
                return;
            }
        };
        match parse_line(&line) {
            Some((time_ms, text)) => {
                if let Err(e) = engine.enqueue(time_ms, text).await {
                    warn!(error = %e, "enqueue failed for an ingress line");
                }
            }
            None => warn!(line, "malformed ingress line, skipping"),
        }
    }
}

fn parse_line(line: &str) -> Option<(i64, String)> {
    let (time_part, text) = line.split_once('\t')?;
    let time_ms: i64 = time_part.trim().parse().ok()?;
    if text.is_empty() {
        return None;
    }
    Some((time_ms, text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_line() {
        assert_eq!(parse_line("1700000000000\thello"), Some((1_700_000_000_000, "hello".to_string())));
    }

    #[test]
    fn rejects_missing_tab() {
        assert_eq!(parse_line("1700000000000 hello"), None);
    }

    #[test]
    fn rejects_non_numeric_time() {
        assert_eq!(parse_line("soon\thello"), None);
    }

    #[test]
    fn rejects_empty_text() {
        assert_eq!(parse_line("1700000000000\t"), None);
    }
}
