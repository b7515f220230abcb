//! In-memory remote used by the engine tests.

use crate::config::ConnectionCfg;
use crate::error::RemoteError;
use crate::remote::{RemoteClient, RemoteConnector, RemoteEntry};
use crate::utils::mtime_secs;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Node {
    is_dir: bool,
    data: Vec<u8>,
    mtime: u64,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    down: bool,
    refuse_connects: u32,
    connects: u32,
    drop_on_put: HashSet<String>,
    failing_puts: HashSet<String>,
    rename_unsupported: bool,
    put_attempts: Vec<String>,
    puts: Vec<String>,
    ops: Vec<String>,
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((p, _)) => p,
    }
}

fn name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_string()
}

fn beneath(path: &str, dir: &str) -> bool {
    if dir == "/" {
        path != "/"
    } else {
        path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
    }
}

impl State {
    fn check_up(&self) -> Result<(), RemoteError> {
        if self.down {
            return Err(RemoteError::Connection("session closed".into()));
        }
        Ok(())
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.nodes.get(path).is_some_and(|n| n.is_dir)
    }
}

/// Shared-state fake remote. Clones observe the same tree, so a test keeps
/// one handle while the worker connects through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_dir(&self, path: &str) {
        let mut st = self.state.lock().unwrap();
        st.nodes.insert(
            path.to_string(),
            Node { is_dir: true, data: Vec::new(), mtime: 0 },
        );
    }

    pub fn seed_file(&self, path: &str, data: &[u8], mtime: u64) {
        let mut st = self.state.lock().unwrap();
        st.nodes.insert(
            path.to_string(),
            Node { is_dir: false, data: data.to_vec(), mtime },
        );
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        st.nodes.get(path).filter(|n| !n.is_dir).map(|n| n.data.clone())
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().is_dir(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().nodes.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().unwrap().nodes.keys().cloned().collect()
    }

    /// Successful uploads of `path`.
    pub fn put_count(&self, path: &str) -> usize {
        let st = self.state.lock().unwrap();
        st.puts.iter().filter(|p| *p == path).count()
    }

    pub fn put_attempts(&self, path: &str) -> usize {
        let st = self.state.lock().unwrap();
        st.put_attempts.iter().filter(|p| *p == path).count()
    }

    /// Every `ensure_dir` call and every successful mutation, in order,
    /// as `"<op> <path>"`.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    /// Every operation fails with a connection error until the next connect.
    pub fn set_down(&self) {
        self.state.lock().unwrap().down = true;
    }

    pub fn refuse_connects(&self, n: u32) {
        self.state.lock().unwrap().refuse_connects = n;
    }

    /// The next upload of `path` kills the session instead of completing.
    pub fn drop_connection_on_put(&self, path: &str) {
        self.state.lock().unwrap().drop_on_put.insert(path.to_string());
    }

    /// Uploads of `path` always fail with an operation error.
    pub fn fail_puts_to(&self, path: &str) {
        self.state.lock().unwrap().failing_puts.insert(path.to_string());
    }

    pub fn disable_rename(&self) {
        self.state.lock().unwrap().rename_unsupported = true;
    }

    fn entry(path: &str, node: &Node) -> RemoteEntry {
        RemoteEntry {
            name: name(path),
            is_dir: node.is_dir,
            size: node.data.len() as u64,
            mtime: node.mtime,
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>, RemoteError> {
        let st = self.state.lock().unwrap();
        st.check_up()?;
        if path == "/" {
            return Ok(Some(RemoteEntry { name: String::new(), is_dir: true, size: 0, mtime: 0 }));
        }
        Ok(st.nodes.get(path).map(|n| Self::entry(path, n)))
    }

    async fn ensure_dir(&self, path: &str) -> Result<(), RemoteError> {
        let mut st = self.state.lock().unwrap();
        st.check_up()?;
        st.ops.push(format!("ensure_dir {path}"));
        let mut cur = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur.push('/');
            cur.push_str(part);
            match st.nodes.get(&cur) {
                Some(n) if n.is_dir => {}
                Some(_) => return Err(RemoteError::Operation(format!("{cur} is a file"))),
                None => {
                    st.nodes.insert(
                        cur.clone(),
                        Node { is_dir: true, data: Vec::new(), mtime: 0 },
                    );
                }
            }
        }
        Ok(())
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let mut st = self.state.lock().unwrap();
        st.check_up()?;
        st.put_attempts.push(remote.to_string());
        if st.drop_on_put.remove(remote) {
            st.down = true;
            return Err(RemoteError::Connection("connection reset".into()));
        }
        if st.failing_puts.contains(remote) {
            return Err(RemoteError::Operation(format!("permission denied: {remote}")));
        }
        if !st.is_dir(parent(remote)) {
            return Err(RemoteError::NotFound(parent(remote).to_string()));
        }
        if st.is_dir(remote) {
            return Err(RemoteError::Operation(format!("{remote} is a directory")));
        }
        let data = std::fs::read(local)?;
        let mtime = mtime_secs(&std::fs::metadata(local)?);
        st.nodes
            .insert(remote.to_string(), Node { is_dir: false, data, mtime });
        st.puts.push(remote.to_string());
        st.ops.push(format!("put {remote}"));
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        let mut st = self.state.lock().unwrap();
        st.check_up()?;
        match st.nodes.get(path) {
            None => Err(RemoteError::NotFound(path.to_string())),
            Some(n) if n.is_dir => Err(RemoteError::Operation(format!("{path} is a directory"))),
            Some(_) => {
                st.nodes.remove(path);
                st.ops.push(format!("delete {path}"));
                Ok(())
            }
        }
    }

    async fn delete_dir(&self, path: &str) -> Result<(), RemoteError> {
        let mut st = self.state.lock().unwrap();
        st.check_up()?;
        if !st.nodes.contains_key(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        st.nodes.retain(|p, _| p != path && !beneath(p, path));
        st.ops.push(format!("delete {path}"));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let mut st = self.state.lock().unwrap();
        st.check_up()?;
        if st.rename_unsupported {
            return Err(RemoteError::Unsupported("rename".into()));
        }
        if !st.nodes.contains_key(from) {
            return Err(RemoteError::NotFound(from.to_string()));
        }
        if st.nodes.contains_key(to) {
            return Err(RemoteError::Operation(format!("{to} already exists")));
        }
        if !st.is_dir(parent(to)) {
            return Err(RemoteError::NotFound(parent(to).to_string()));
        }
        let moved: Vec<String> = st
            .nodes
            .keys()
            .filter(|p| *p == from || beneath(p, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = st.nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                st.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let st = self.state.lock().unwrap();
        st.check_up()?;
        if !st.is_dir(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        Ok(st
            .nodes
            .iter()
            .filter(|(p, _)| p.as_str() != "/" && parent(p) == path)
            .map(|(p, n)| Self::entry(p, n))
            .collect())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[async_trait]
impl RemoteConnector for MemoryRemote {
    async fn connect(&self, _conn: &ConnectionCfg) -> Result<Box<dyn RemoteClient>, RemoteError> {
        let mut st = self.state.lock().unwrap();
        if st.refuse_connects > 0 {
            st.refuse_connects -= 1;
            return Err(RemoteError::Connection("connection refused".into()));
        }
        st.down = false;
        st.connects += 1;
        Ok(Box::new(self.clone()))
    }
}
