use russh_sftp::client::error::Error;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use std::io;
use treesync_core::RemoteError;

/// Translate an SFTP failure on `path` into the engine's error taxonomy.
pub(crate) fn map_sftp(e: Error, path: &str) -> RemoteError {
    match e {
        Error::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => RemoteError::NotFound(path.to_string()),
            StatusCode::OpUnsupported => RemoteError::Unsupported(status.error_message),
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                RemoteError::Connection(status.error_message)
            }
            code => RemoteError::Operation(format!("{path}: {code:?} {}", status.error_message)),
        },
        Error::Timeout => RemoteError::Timeout,
        Error::IO(msg) => RemoteError::Connection(msg),
        other => RemoteError::Operation(format!("{path}: {other}")),
    }
}

/// Errors while streaming file contents: a broken channel means the session is gone.
pub(crate) fn map_transfer(e: io::Error, path: &str) -> RemoteError {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::TimedOut => RemoteError::Connection(format!("{path}: {e}")),
        _ => RemoteError::Operation(format!("{path}: {e}")),
    }
}

pub(crate) fn permissions(mode: u32) -> FileAttributes {
    let mut attrs = FileAttributes::empty();
    attrs.permissions = Some(mode);
    attrs
}

/// Prefixes of an absolute remote path, shortest first: `/a/b` yields `/a`, `/a/b`.
fn prefixes(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if path.starts_with('/') || !cur.is_empty() {
            cur.push('/');
        }
        cur.push_str(part);
        out.push(cur.clone());
    }
    out
}

/// Create `path` and every missing parent.
///
/// Fails if any component exists as a file. With `permissive` set, each
/// directory created here is chmod'ed to 0777.
pub(crate) async fn create_dir_all(
    sftp: &SftpSession,
    path: &str,
    permissive: bool,
) -> Result<(), RemoteError> {
    // fast path: the target already exists
    match sftp.metadata(path).await {
        Ok(attrs) if attrs.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(RemoteError::Operation(format!(
                "a file with the same name already exists: {path}"
            )))
        }
        Err(e) => match map_sftp(e, path) {
            RemoteError::NotFound(_) => {}
            other => return Err(other),
        },
    }

    for p in prefixes(path) {
        match sftp.create_dir(p.as_str()).await {
            Ok(()) => {
                if permissive {
                    sftp.set_metadata(p.as_str(), permissions(0o777))
                        .await
                        .map_err(|e| map_sftp(e, &p))?;
                }
            }
            Err(e) => {
                // most servers answer a plain Failure when the directory exists
                let err = map_sftp(e, &p);
                if err.is_connection() {
                    return Err(err);
                }
                match sftp.metadata(p.as_str()).await {
                    Ok(attrs) if attrs.is_dir() => {}
                    Ok(_) => {
                        return Err(RemoteError::Operation(format!(
                            "path component is a file, not a directory: {p}"
                        )))
                    }
                    Err(_) => return Err(err),
                }
            }
        }
    }
    Ok(())
}

/// Remove a directory and everything below it. A missing directory is not
/// an error; entries that vanish while walking are skipped.
pub(crate) async fn remove_dir_all(sftp: &SftpSession, path: &str) -> Result<(), RemoteError> {
    match sftp.metadata(path).await {
        Ok(attrs) if attrs.is_dir() => {}
        Ok(_) => return Err(RemoteError::Operation(format!("path is not a directory: {path}"))),
        Err(e) => {
            return match map_sftp(e, path) {
                RemoteError::NotFound(_) => Ok(()),
                other => Err(other),
            }
        }
    }

    // iterative DFS, directories removed post-order
    let mut stack: Vec<(String, bool)> = vec![(path.to_string(), false)];
    while let Some((dir, visited)) = stack.pop() {
        if visited {
            ignore_missing(sftp.remove_dir(dir.as_str()).await, &dir)?;
            continue;
        }
        stack.push((dir.clone(), true));
        let entries = match sftp.read_dir(dir.as_str()).await {
            Ok(entries) => entries,
            Err(e) => match map_sftp(e, &dir) {
                RemoteError::NotFound(_) => continue,
                other => return Err(other),
            },
        };
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child = format!("{}/{name}", dir.trim_end_matches('/'));
            if entry.metadata().is_dir() {
                stack.push((child, false));
            } else {
                ignore_missing(sftp.remove_file(child.as_str()).await, &child)?;
            }
        }
    }
    Ok(())
}

fn ignore_missing(res: Result<(), Error>, path: &str) -> Result<(), RemoteError> {
    match res {
        Ok(()) => Ok(()),
        Err(e) => match map_sftp(e, path) {
            RemoteError::NotFound(_) => Ok(()),
            other => Err(other),
        },
    }
}
