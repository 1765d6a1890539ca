use std::time::Duration;

use thiserror::Error;

/// Everything a session's `run` can surface. `Disconnect` is raised
/// internally for protocol violations and carries the blacklist decision;
/// the other variants are transient and never blacklist.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("batch request failed: {0}")]
    Batch(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{reason}")]
    Disconnect { reason: String, blacklist: bool },
    #[error(transparent)]
    Transport(#[from] std::io::Error),
}

impl SessionError {
    pub fn disconnect(reason: impl Into<String>) -> Self {
        SessionError::Disconnect {
            reason: reason.into(),
            blacklist: false,
        }
    }

    pub fn blacklist(reason: impl Into<String>) -> Self {
        SessionError::Disconnect {
            reason: reason.into(),
            blacklist: true,
        }
    }

    /// Whether the error calls for blacklisting the server.
    #[must_use]
    pub fn wants_blacklist(&self) -> bool {
        matches!(
            self,
            SessionError::Disconnect {
                blacklist: true,
                ..
            }
        )
    }
}

/// Substring rules mapping server-side broadcast rejections to a fixed
/// human-readable reason.
const BROADCAST_TX_MSG_LIST: &[(&[&str], &str)] = &[
    (&["dust"], "very small \"dust\" payments"),
    (
        &["Missing inputs", "Inputs unavailable", "bad-txns-inputs-spent"],
        "missing, already-spent, or otherwise invalid coins",
    ),
    (&["insufficient priority"], "insufficient fees or priority"),
    (
        &["bad-txns-premature-spend-of-coinbase"],
        "attempt to spend an unmatured coinbase",
    ),
    (
        &["txn-already-in-mempool", "txn-already-known"],
        "it already exists in the server's mempool",
    ),
    (
        &["txn-mempool-conflict"],
        "it conflicts with one already in the server's mempool",
    ),
    (
        &["bad-txns-nonstandard-inputs"],
        "use of non-standard input scripts",
    ),
    (&["absurdly-high-fee"], "fee is absurdly high"),
    (
        &["non-mandatory-script-verify-flag"],
        "the script fails verification",
    ),
    (&["tx-size"], "transaction is too large"),
    (&["scriptsig-size"], "it contains an oversized script"),
    (&["scriptpubkey"], "it contains a non-standard signature"),
    (&["bare-multisig"], "it contains a bare multisig input"),
    (
        &["multi-op-return"],
        "it contains more than 1 OP_RETURN input",
    ),
    (
        &["scriptsig-not-pushonly"],
        "a scriptsig is not simply data",
    ),
    (&["bad-txns-nonfinal"], "transaction is not final"),
];

/// Maps a broadcast failure to the reason shown to the user.
#[must_use]
pub fn broadcast_failure_reason(error: &SessionError) -> &'static str {
    if let SessionError::Rpc { message, .. } = error {
        for (needles, reason) in BROADCAST_TX_MSG_LIST {
            if needles.iter().any(|needle| message.contains(needle)) {
                return reason;
            }
        }
    }
    "reason unknown"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(message: &str) -> SessionError {
        SessionError::Rpc {
            code: 1,
            message: message.to_string(),
        }
    }

    #[test]
    fn known_rejections_are_translated() {
        let error = rpc("64: dust");
        assert_eq!(
            broadcast_failure_reason(&error),
            "very small \"dust\" payments"
        );

        let error = rpc("the tx is bad-txns-inputs-spent here");
        assert_eq!(
            broadcast_failure_reason(&error),
            "missing, already-spent, or otherwise invalid coins"
        );

        let error = rpc("258: txn-mempool-conflict");
        assert_eq!(
            broadcast_failure_reason(&error),
            "it conflicts with one already in the server's mempool"
        );
    }

    #[test]
    fn unmatched_messages_fall_through() {
        assert_eq!(
            broadcast_failure_reason(&rpc("weird new error")),
            "reason unknown"
        );
        assert_eq!(
            broadcast_failure_reason(&SessionError::Timeout(Duration::from_secs(10))),
            "reason unknown"
        );
    }

    #[test]
    fn blacklist_flag_follows_the_constructor() {
        assert!(SessionError::blacklist("bad proof").wants_blacklist());
        assert!(!SessionError::disconnect("bad batch").wants_blacklist());
        assert!(!rpc("x").wants_blacklist());
    }
}
