/// Identity of the authenticated requester, handed down to the child as
/// environment variables.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user: String,
    pub ipaddress: String,
    pub hostname: Option<String>,
}

/// Build the `KEY=VALUE` environment entries to set in the child before exec.
/// These five names (`REMUSER`, `REMOTE_USER`, `REMOTE_ADDR`, `REMOTE_HOST`,
/// `REMCTL_COMMAND`) are an interface contract with user commands; changing
/// them is a breaking change.
///
/// `command` is the request's command token (`REMCTL_COMMAND`). Returns an
/// error if any value would contain a NUL byte, which cannot be represented
/// in a C environment string and is therefore a fatal setup error.
pub fn build_child_env(identity: &ClientIdentity, command: &str) -> Result<Vec<(String, String)>, String> {
    let mut entries = vec![
        ("REMUSER".to_string(), identity.user.clone()),
        ("REMOTE_USER".to_string(), identity.user.clone()),
        ("REMOTE_ADDR".to_string(), identity.ipaddress.clone()),
        ("REMCTL_COMMAND".to_string(), command.to_string()),
    ];
    if let Some(hostname) = &identity.hostname {
        entries.push(("REMOTE_HOST".to_string(), hostname.clone()));
    }

    for (key, value) in &entries {
        if value.contains('\0') {
            return Err(format!("{key} contains NUL"));
        }
    }

    Ok(entries)
}

/// Build the child's full `envp`: the server process's own inherited
/// environment, with `overlay` (the five `REMCTL_*` entries from
/// `build_child_env`) replacing any same-named inherited variable.
///
/// `exec` replaces the process image but not its environment block by
/// itself — passing only `overlay` as `envp` would wipe `PATH`, `HOME`,
/// `LD_LIBRARY_PATH`, and everything else the command needs, not merely set
/// the five remctl-specific variables §4.3 step 6 calls for.
pub fn merged_environment(overlay: Vec<(String, String)>) -> Vec<Vec<u8>> {
    use std::os::unix::ffi::OsStrExt;

    let overlay_keys: Vec<&str> = overlay.iter().map(|(k, _)| k.as_str()).collect();

    let mut entries: Vec<Vec<u8>> = std::env::vars_os()
        .filter(|(k, _)| !overlay_keys.contains(&k.to_string_lossy().as_ref()))
        .map(|(k, v)| {
            let mut kv = k.as_bytes().to_vec();
            kv.push(b'=');
            kv.extend_from_slice(v.as_bytes());
            kv
        })
        .collect();

    for (k, v) in overlay {
        let mut kv = k.into_bytes();
        kv.push(b'=');
        kv.extend_from_slice(v.as_bytes());
        entries.push(kv);
    }

    entries
}
