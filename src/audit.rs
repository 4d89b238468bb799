use crate::rule::Rule;

/// Mask argument positions the matched rule marks as sensitive before they
/// ever reach a log line, per the rule's `sensitive_args`.
///
/// `args` are the argument chunks (1-based position = `offset + 1`), already
/// lossily decoded to `String` for display purposes only — masking never
/// affects the bytes actually sent to the child.
pub fn masked_command_line(command: &str, subcommand: Option<&str>, args: &[String], rule: Option<&Rule>) -> String {
    let mut parts = vec![command.to_string()];
    if let Some(sub) = subcommand {
        parts.push(sub.to_string());
    }

    let sensitive: &[usize] = rule.map(|r| r.sensitive_args.as_slice()).unwrap_or(&[]);
    for (offset, arg) in args.iter().enumerate() {
        let position = offset + 1;
        if sensitive.contains(&position) {
            parts.push("***".to_string());
        } else {
            parts.push(arg.clone());
        }
    }

    parts.join(" ")
}

/// The audit sink interface.
/// The default path routes through `tracing`; implement this trait for the
/// one piece of behavior a deployment may want to redirect elsewhere (e.g. a
/// dedicated audit log file distinct from the daemon's general log).
pub trait AuditSink {
    fn record_command(&self, user: &str, masked_command_line: &str);
}

/// Default sink: emits one `tracing::info!` event per command.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_command(&self, user: &str, masked_command_line: &str) {
        tracing::info!(user, command = masked_command_line, "command dispatched");
    }
}
