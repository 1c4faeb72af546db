//! Tracking of connected callers.
//!
//! Each accepted connection gets a synthetic bus address `:1.N`; the
//! registry keeps identity data for addresses that registered themselves,
//! and synthesizes throwaway records for unregistered transaction
//! initiators so the journal record is still useful.

use std::collections::HashMap;
use std::sync::Mutex;

/// Peer credentials captured at accept time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Peer uid, if the socket layer provided one.
    pub uid: Option<u32>,
    /// Peer pid, if the socket layer provided one.
    pub pid: Option<i32>,
}

/// One tracked caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Client {
    /// Synthetic bus address.
    pub address: String,
    /// Caller-provided identity label.
    pub id: Option<String>,
    /// Peer uid.
    pub uid: Option<u32>,
    /// Peer pid.
    pub pid: Option<i32>,
    /// The systemd unit the peer runs in, user unit preferred.
    pub sd_unit: Option<String>,
}

impl Client {
    fn new(address: &str, id: Option<String>, creds: PeerCredentials) -> Self {
        let sd_unit = creds.pid.and_then(unit_for_pid);
        Self {
            address: address.to_owned(),
            id,
            uid: creds.uid,
            pid: creds.pid,
            sd_unit,
        }
    }

    /// Render for logging, matching the daemon's historical format.
    pub fn to_log_string(&self) -> String {
        let mut buf = String::from("client(");
        if let Some(id) = &self.id {
            buf.push_str(&format!("id:{id} "));
        }
        // Addresses carry a leading ':' already
        buf.push_str(&format!("dbus{}", self.address));
        if let Some(unit) = &self.sd_unit {
            buf.push_str(&format!(" unit:{unit}"));
        }
        match self.uid {
            Some(uid) => buf.push_str(&format!(" uid:{uid}")),
            None => buf.push_str(" uid:<unknown>"),
        }
        buf.push(')');
        buf
    }
}

/// Registry of callers that invoked `RegisterClient`.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Client>>,
}

impl ClientRegistry {
    /// Add or update the entry for `address`.
    pub fn register(&self, address: &str, id: Option<String>, creds: PeerCredentials) {
        let client = Client::new(address, id, creds);
        tracing::info!("Client registered: {}", client.to_log_string());
        self.clients
            .lock()
            .unwrap()
            .insert(address.to_owned(), client);
    }

    /// Remove the entry for `address`; true if one existed.
    pub fn unregister(&self, address: &str) -> bool {
        let removed = self.clients.lock().unwrap().remove(address);
        if let Some(c) = &removed {
            tracing::info!("Client unregistered: {}", c.to_log_string());
        }
        removed.is_some()
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Whether no client is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The registered entry for `address`, if any.
    pub fn get(&self, address: &str) -> Option<Client> {
        self.clients.lock().unwrap().get(address).cloned()
    }

    /// The entry for `address`, synthesizing an untracked one from the
    /// connection's credentials if the caller never registered. Used for
    /// journal records; the synthesized entry is not stored and its
    /// disconnection is not watched.
    pub fn snapshot_or_synthesize(&self, address: &str, creds: PeerCredentials) -> Client {
        self.get(address)
            .unwrap_or_else(|| Client::new(address, None, creds))
    }

    /// Render the entry for `address` for logging.
    pub fn format_client(&self, address: &str, creds: PeerCredentials) -> String {
        self.snapshot_or_synthesize(address, creds).to_log_string()
    }
}

/// The systemd unit a pid runs in, from its cgroup path; user units are
/// preferred over system units.
fn unit_for_pid(pid: i32) -> Option<String> {
    let path = format!("/proc/{pid}/cgroup");
    let content = std::fs::read_to_string(path).ok()?;
    unit_from_cgroup(&content)
}

fn unit_from_cgroup(content: &str) -> Option<String> {
    // The unified hierarchy has a single "0::/..." line; fall back to
    // scanning every line for older layouts.
    let mut system_unit = None;
    for line in content.lines() {
        let path = line.rsplit(':').next().unwrap_or("");
        let mut in_user_slice = false;
        for comp in path.split('/') {
            let is_unit = comp.ends_with(".service") || comp.ends_with(".scope");
            if comp.starts_with("user@") && comp.ends_with(".service") {
                in_user_slice = true;
                continue;
            }
            if !is_unit {
                continue;
            }
            if in_user_slice {
                // First unit inside the user manager wins
                return Some(comp.to_owned());
            }
            system_unit = Some(comp.to_owned());
        }
    }
    system_unit
}

/// Whether the pid is part of a logind session (used for register/unregister
/// self-authorization).
pub(crate) fn pid_has_active_session(pid: i32) -> bool {
    let path = format!("/proc/{pid}/cgroup");
    match std::fs::read_to_string(path) {
        Ok(content) => cgroup_has_session(&content),
        Err(_) => false,
    }
}

fn cgroup_has_session(content: &str) -> bool {
    content.lines().any(|line| {
        let path = line.rsplit(':').next().unwrap_or("");
        path.split('/')
            .any(|comp| comp.starts_with("session-") && comp.ends_with(".scope"))
    })
}
