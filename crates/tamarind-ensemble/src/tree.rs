//! Hierarchical node namespace
//!
//! `DataTree` holds every node of the in-memory ensemble together with its
//! metadata. It is not synchronised; the ensemble serialises access.

use std::collections::{BTreeSet, HashMap};

use tamarind_common::{
    ANY_VERSION, CreateMode, KeeperError, KeeperResult, Stat, parent_path, validate_path,
};

/// A node and its metadata
#[derive(Debug, Clone, Default)]
pub struct DataNode {
    pub data: Vec<u8>,
    pub stat: Stat,
}

/// The node namespace of one ensemble
#[derive(Debug)]
pub struct DataTree {
    nodes: HashMap<String, DataNode>,
    /// parent path -> child names
    children: HashMap<String, BTreeSet<String>>,
    /// session id -> ephemeral paths it owns
    ephemerals: HashMap<i64, BTreeSet<String>>,
    /// Last assigned transaction id
    zxid: i64,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), DataNode::default());
        Self {
            nodes,
            children: HashMap::new(),
            ephemerals: HashMap::new(),
            zxid: 0,
        }
    }

    /// Create a node. Ephemeral modes bind it to `session_id`.
    pub fn create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session_id: i64,
    ) -> KeeperResult<String> {
        validate_path(path)?;
        if mode.is_ephemeral() && session_id == 0 {
            return Err(KeeperError::BadArguments(
                "ephemeral node requires a session".to_string(),
            ));
        }

        let parent = match parent_path(path) {
            Some(parent) => parent.to_string(),
            None => return Err(KeeperError::NodeExists(path.to_string())),
        };
        let parent_stat = match self.nodes.get(&parent) {
            Some(node) => node.stat,
            None => return Err(KeeperError::NoNode(path.to_string())),
        };
        if parent_stat.is_ephemeral() {
            return Err(KeeperError::NoChildrenForEphemerals(path.to_string()));
        }

        let actual = if mode.is_sequential() {
            format!("{}{:010}", path, parent_stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(KeeperError::NodeExists(actual));
        }

        let zxid = self.next_zxid();
        let now = current_timestamp();
        let owner = if mode.is_ephemeral() { session_id } else { 0 };
        let node = DataNode {
            data: data.to_vec(),
            stat: Stat {
                czxid: zxid,
                mzxid: zxid,
                ctime: now,
                mtime: now,
                ephemeral_owner: owner,
                data_length: data.len() as i32,
                pzxid: zxid,
                ..Default::default()
            },
        };

        let name = actual[parent.len()..].trim_start_matches('/').to_string();
        self.nodes.insert(actual.clone(), node);
        self.children.entry(parent.clone()).or_default().insert(name);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.stat.cversion += 1;
            parent_node.stat.num_children += 1;
            parent_node.stat.pzxid = zxid;
        }
        if owner != 0 {
            self.ephemerals
                .entry(owner)
                .or_default()
                .insert(actual.clone());
        }

        Ok(actual)
    }

    /// Delete a leaf node, checking `version` unless it is `ANY_VERSION`.
    pub fn delete(&mut self, path: &str, version: i32) -> KeeperResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(KeeperError::BadArguments(
                "cannot delete the root node".to_string(),
            ));
        }

        let stat = match self.nodes.get(path) {
            Some(node) => node.stat,
            None => return Err(KeeperError::NoNode(path.to_string())),
        };
        if version != ANY_VERSION && version != stat.version {
            return Err(KeeperError::BadVersion(path.to_string()));
        }
        if stat.num_children > 0 {
            return Err(KeeperError::NotEmpty(path.to_string()));
        }

        self.remove_node(path);
        Ok(())
    }

    pub fn get_data(&self, path: &str) -> KeeperResult<(Vec<u8>, Stat)> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat))
            .ok_or_else(|| KeeperError::NoNode(path.to_string()))
    }

    /// Overwrite node data, checking `version` unless it is `ANY_VERSION`.
    pub fn set_data(&mut self, path: &str, data: &[u8], version: i32) -> KeeperResult<Stat> {
        validate_path(path)?;
        let current = match self.nodes.get(path) {
            Some(node) => node.stat.version,
            None => return Err(KeeperError::NoNode(path.to_string())),
        };
        if version != ANY_VERSION && version != current {
            return Err(KeeperError::BadVersion(path.to_string()));
        }

        let zxid = self.next_zxid();
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| KeeperError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = current_timestamp();
        node.stat.data_length = data.len() as i32;
        Ok(node.stat)
    }

    pub fn stat(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|node| node.stat)
    }

    /// Sorted child names of a node.
    pub fn children(&self, path: &str) -> KeeperResult<Vec<String>> {
        validate_path(path)?;
        if !self.nodes.contains_key(path) {
            return Err(KeeperError::NoNode(path.to_string()));
        }
        Ok(self
            .children
            .get(path)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Remove every ephemeral node owned by a session. Returns the removed paths.
    pub fn kill_session(&mut self, session_id: i64) -> Vec<String> {
        let paths: Vec<String> = self
            .ephemerals
            .remove(&session_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for path in &paths {
            self.remove_node(path);
        }
        paths
    }

    /// Ephemeral paths currently owned by a session.
    pub fn ephemerals(&self, session_id: i64) -> Vec<String> {
        self.ephemerals
            .get(&session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn last_zxid(&self) -> i64 {
        self.zxid
    }

    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn remove_node(&mut self, path: &str) {
        let Some(node) = self.nodes.remove(path) else {
            return;
        };
        let zxid = self.next_zxid();

        if let Some(parent) = parent_path(path) {
            let name = path[parent.len()..].trim_start_matches('/');
            if let Some(names) = self.children.get_mut(parent) {
                names.remove(name);
                if names.is_empty() {
                    self.children.remove(parent);
                }
            }
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.stat.cversion += 1;
                parent_node.stat.num_children -= 1;
                parent_node.stat.pzxid = zxid;
            }
        }

        let owner = node.stat.ephemeral_owner;
        if owner != 0
            && let Some(owned) = self.ephemerals.get_mut(&owner)
        {
            owned.remove(path);
            if owned.is_empty() {
                self.ephemerals.remove(&owner);
            }
        }
    }
}

fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
