use crate::rule::Rule;

/// One opaque byte chunk of the request: chunk 0 is the command, chunk 1 (if
/// present) the subcommand, chunks `>= 1` are argv positions.
pub type Chunk = Vec<u8>;

/// Why a request was rejected before a child was ever launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// `argv_chunks` was empty.
    EmptyRequest,
    /// A NUL byte appeared in a chunk where it is forbidden.
    NulInChunk { index: usize },
}

/// Resolve `stdin_arg_index` against the actual argument count of this
/// request: the `-1` sentinel means "the last argument", resolved at
/// request time. Argument positions are 1-based; `None` means "no stdin arg".
///
/// `arg_count` is the number of argument chunks (chunks at index >= 2, i.e.
/// excluding command and subcommand).
pub fn resolve_stdin_position(stdin_arg_index: i32, arg_count: usize) -> Option<usize> {
    if stdin_arg_index == 0 {
        None
    } else if stdin_arg_index == -1 {
        if arg_count == 0 { None } else { Some(arg_count) }
    } else if stdin_arg_index > 0 {
        Some(stdin_arg_index as usize)
    } else {
        None
    }
}

/// Validate the NUL-byte policy over argument chunks.
///
/// `chunks` are the argument chunks only (command/subcommand chunks are
/// validated separately by the caller, since they are validated earlier in
/// the dispatch sequence and have no stdin exception). `stdin_position` is the
/// 1-based position permitted to contain NUL, or `None` if no chunk is exempt.
pub fn validate_argument_chunks(
    chunks: &[Chunk],
    stdin_position: Option<usize>,
) -> Result<(), ValidationError> {
    for (offset, chunk) in chunks.iter().enumerate() {
        let position = offset + 1;
        if Some(position) == stdin_position {
            continue;
        }
        if chunk.contains(&0) {
            return Err(ValidationError::NulInChunk { index: position });
        }
    }
    Ok(())
}

/// Validate that a single chunk (command or subcommand) contains no NUL byte.
pub fn validate_token_chunk(chunk: &[u8]) -> Result<(), ValidationError> {
    if chunk.contains(&0) {
        Err(ValidationError::NulInChunk { index: 0 })
    } else {
        Ok(())
    }
}

/// The built argv plus any stdin payload captured out of it.
pub struct BuiltArgv {
    pub argv: Vec<Vec<u8>>,
    pub stdin_payload: Option<Vec<u8>>,
}

/// Build argv for a normal command dispatch.
///
/// `args` are the argument chunks (chunk index >= 2 in the wire request).
pub fn build_normal_argv(rule: &Rule, args: &[Chunk]) -> BuiltArgv {
    let stdin_position = resolve_stdin_position(rule.stdin_arg_index, args.len());
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(rule.program_basename().as_bytes().to_vec());
    let mut stdin_payload = None;

    for (offset, chunk) in args.iter().enumerate() {
        let position = offset + 1;
        if Some(position) == stdin_position {
            stdin_payload = Some(chunk.clone());
            continue;
        }
        argv.push(chunk.clone());
    }

    BuiltArgv { argv, stdin_payload }
}

/// Build argv for a `help <cmd> [<sub>]` dispatch.
///
/// Returns `None` if the rule has no `help_subcommand` (the caller's cue to
/// emit `NO_HELP` instead). `client_subcommand` is the client-supplied third
/// token, if any; it is preserved verbatim in argv[2] even though the
/// matched rule's `help_subcommand` replaces argv[1].
pub fn build_help_argv(rule: &Rule, client_subcommand: Option<&[u8]>) -> Option<BuiltArgv> {
    let help_subcommand = rule.help_subcommand.as_deref()?;

    let mut argv = vec![
        rule.program_basename().as_bytes().to_vec(),
        help_subcommand.as_bytes().to_vec(),
    ];
    if let Some(sub) = client_subcommand {
        argv.push(sub.to_vec());
    }
    Some(BuiltArgv { argv, stdin_payload: None })
}

/// Build argv for a summary invocation.
///
/// Returns `None` if the rule has no `summary_subcommand` (the caller's cue
/// to skip this rule in the summary listing).
pub fn build_summary_argv(rule: &Rule) -> Option<BuiltArgv> {
    let summary_subcommand = rule.summary_subcommand.as_deref()?;

    Some(BuiltArgv {
        argv: vec![
            rule.program_basename().as_bytes().to_vec(),
            summary_subcommand.as_bytes().to_vec(),
        ],
        stdin_payload: None,
    })
}
