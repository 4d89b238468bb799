use nix::sys::wait::waitpid;

use crate::acl::AclChecker;
use crate::audit::{masked_command_line, AuditSink};
use crate::env::ClientIdentity;
use crate::launch::{launch, LaunchRequest};
use crate::pump::{pump, PumpLimits};
use crate::request::{
    build_help_argv, build_normal_argv, build_summary_argv, resolve_stdin_position,
    validate_argument_chunks, validate_token_chunk, Chunk,
};
use crate::rule::{resolve, Rule, RuleTable};
use crate::status::canonicalize;
use crate::transport::{ClientInfo, ErrorCode, Transport};

/// Decodes a chunk for display/resolution purposes only. Matching and
/// environment construction use this lossy form; the bytes sent to the
/// child always come from the original chunk — argv is binary-safe.
fn decode_token(chunk: &Chunk) -> String {
    String::from_utf8_lossy(chunk).into_owned()
}

/// Run one request to completion, emitting exactly one terminating frame
/// on every path.
#[tracing::instrument(skip_all, fields(user = %client.user))]
pub fn run(
    client: &ClientInfo,
    rules: &RuleTable,
    acl: &dyn AclChecker,
    audit: &dyn AuditSink,
    transport: &mut dyn Transport,
    argv_chunks: &[Chunk],
    limits: PumpLimits,
) {
    // 1. Empty request.
    if argv_chunks.is_empty() {
        let _ = transport.send_error(ErrorCode::BadCommand, "empty request");
        return;
    }

    // 2. NUL policy for chunks 0 and 1.
    if validate_token_chunk(&argv_chunks[0]).is_err() {
        let _ = transport.send_error(ErrorCode::BadCommand, "NUL byte in command");
        return;
    }
    if let Some(sub_chunk) = argv_chunks.get(1) {
        if validate_token_chunk(sub_chunk).is_err() {
            let _ = transport.send_error(ErrorCode::BadCommand, "NUL byte in subcommand");
            return;
        }
    }

    // 3. Materialize command/subcommand.
    let command = decode_token(&argv_chunks[0]);
    let mut subcommand = argv_chunks.get(1).map(decode_token);

    // 4. Resolve.
    let mut rule = resolve(rules, Some(command.as_str()), subcommand.as_deref());

    // 5. Help routing.
    let mut help_mode = false;
    let mut help_command = command.clone();
    let mut help_subcommand_client: Option<Chunk> = None;

    if rule.is_none() && command == "help" {
        if argv_chunks.len() >= 4 {
            let _ = transport.send_error(ErrorCode::TooManyArgs, "too many arguments to help");
        }
        match &subcommand {
            None => {
                run_summary(client, rules, acl, transport, limits);
                return;
            }
            Some(target_command) => {
                help_mode = true;
                help_command = target_command.clone();
                let target_subcommand = argv_chunks.get(2).cloned();
                help_subcommand_client = target_subcommand.clone();
                let target_subcommand_str = target_subcommand.as_ref().map(decode_token);
                rule = resolve(rules, Some(help_command.as_str()), target_subcommand_str.as_deref());
                subcommand = target_subcommand_str;
            }
        }
    }

    // 6. NUL policy for remaining argument chunks, honoring stdin exception.
    let args: &[Chunk] = if argv_chunks.len() > 2 { &argv_chunks[2..] } else { &[] };
    let stdin_position = rule.and_then(|r| resolve_stdin_position(r.stdin_arg_index, args.len()));
    if validate_argument_chunks(args, stdin_position).is_err() {
        let _ = transport.send_error(ErrorCode::BadCommand, "NUL byte in argument");
        return;
    }

    // 7. Audit log (masked).
    let display_args: Vec<String> = args.iter().map(decode_token).collect();
    let masked = masked_command_line(&help_command, subcommand.as_deref(), &display_args, rule);
    audit.record_command(&client.user, &masked);

    // 8. No rule matched.
    let Some(rule) = rule else {
        let _ = transport.send_error(ErrorCode::UnknownCommand, "no matching command");
        return;
    };

    // 9. ACL.
    if !acl.acl_permit(rule, &client.user) {
        let _ = transport.send_error(ErrorCode::Access, "access denied");
        return;
    }

    // 10/11. Build argv.
    let built = if help_mode {
        let Some(built) = build_help_argv(rule, help_subcommand_client.as_deref()) else {
            let _ = transport.send_error(ErrorCode::NoHelp, "no help available");
            return;
        };
        built
    } else {
        build_normal_argv(rule, args)
    };

    let identity = ClientIdentity {
        user: client.user.clone(),
        ipaddress: client.ipaddress.clone(),
        hostname: client.hostname.clone(),
    };

    dispatch_one(
        rule,
        &built.argv,
        built.stdin_payload.as_deref(),
        &identity,
        &help_command,
        client,
        transport,
        limits,
    );
}

/// Launch one rule's program, pump it to completion, and emit the
/// terminating frame (steps 12-13). Shared between the normal/help
/// path and each invocation inside a summary response.
fn dispatch_one(
    rule: &Rule,
    argv: &[Vec<u8>],
    stdin_payload: Option<&[u8]>,
    identity: &ClientIdentity,
    command_token: &str,
    client: &ClientInfo,
    transport: &mut dyn Transport,
    limits: PumpLimits,
) {
    let req = LaunchRequest {
        rule,
        argv,
        stdin_payload,
        identity,
        command_token,
        protocol_v1: client.is_v1(),
    };

    let handle = match launch(&req) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "failed to launch command");
            let _ = transport.send_error(ErrorCode::Internal, "internal error");
            return;
        }
    };

    let pid = handle.pid;

    let outcome = match pump(handle, stdin_payload.map(|s| s.to_vec()), client.is_v1(), transport, limits) {
        Ok(o) => o,
        Err(e) => {
            tracing::error!(error = %e, "pump loop failed");
            let _ = transport.send_error(ErrorCode::Internal, "internal error");
            return;
        }
    };

    // 13. Blocking-reap fallback if the pump didn't reap the child.
    let status = if outcome.reaped {
        outcome.exit_status
    } else {
        waitpid(pid, None).as_ref().map(canonicalize).unwrap_or(-1)
    };

    if outcome.broke {
        tracing::warn!("pump loop broke on a transport or I/O error; child reaped, aborting request");
        let _ = transport.send_error(ErrorCode::Internal, "internal error");
        return;
    }

    // 12. Terminating frame.
    if client.is_v1() {
        let _ = transport.send_output_v1(&outcome.output_v1, status);
    } else {
        let _ = transport.send_status_v2(status);
    }
}

/// Summary response across every `ALL`-subcommand rule the caller
/// may use, each with a configured `summary_subcommand`.
fn run_summary(
    client: &ClientInfo,
    rules: &RuleTable,
    acl: &dyn AclChecker,
    transport: &mut dyn Transport,
    limits: PumpLimits,
) {
    use crate::rule::MatchToken;

    let mut any = false;
    let mut v1_output = Vec::new();
    let mut aggregated_status = 0i32;

    for rule in rules.rules() {
        if rule.subcommand != MatchToken::All {
            continue;
        }
        let Some(summary_subcommand) = rule.summary_subcommand.as_deref() else {
            continue;
        };
        if !acl.acl_permit(rule, &client.user) {
            continue;
        }

        any = true;
        let built = build_summary_argv(rule).expect("summary_subcommand checked above");
        let identity = ClientIdentity {
            user: client.user.clone(),
            ipaddress: client.ipaddress.clone(),
            hostname: client.hostname.clone(),
        };

        let req = LaunchRequest {
            rule,
            argv: &built.argv,
            stdin_payload: None,
            identity: &identity,
            command_token: summary_subcommand,
            protocol_v1: client.is_v1(),
        };

        let handle = match launch(&req) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, "failed to launch summary command");
                continue;
            }
        };
        let pid = handle.pid;

        let outcome = match pump(handle, None, client.is_v1(), transport, limits) {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(error = %e, "pump loop failed during summary");
                continue;
            }
        };

        let status = if outcome.reaped {
            outcome.exit_status
        } else {
            waitpid(pid, None).as_ref().map(canonicalize).unwrap_or(-1)
        };

        if outcome.broke {
            tracing::warn!("pump loop broke on a transport or I/O error during summary; aborting");
            let _ = transport.send_error(ErrorCode::Internal, "internal error");
            return;
        }

        if status != 0 {
            aggregated_status = status;
        }
        if client.is_v1() {
            v1_output.extend_from_slice(&outcome.output_v1);
        }
    }

    if !any {
        let _ = transport.send_error(ErrorCode::UnknownCommand, "no summary commands available");
        return;
    }

    if client.is_v1() {
        let _ = transport.send_output_v1(&v1_output, aggregated_status);
    } else {
        let _ = transport.send_status_v2(aggregated_status);
    }
}
