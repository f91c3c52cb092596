//! Server-state parsing and the slot table.
//!
//! HAProxy pre-declares a fixed set of server-template slots per
//! backend. A slot either carries a live backend address or sits in
//! maintenance waiting to be assigned; the slot table is the local
//! projection of that state for one reconcile.

use std::collections::{BTreeMap, BTreeSet};

use crate::HaproxyError;

/// `show servers state` dump format this client understands.
pub const STATE_FORMAT_VERSION: &str = "1";

/// Fields per server line in a version-1 dump.
pub const SERVER_STATE_FIELDS: usize = 19;

/// Operational state of a ready backend server.
///
/// These encodings are pinned against HAProxy 2.x; the format-version
/// check above rejects dumps from incompatible releases.
pub const SRV_OP_STATE_RUNNING: u32 = 2;

/// Admin state of an enabled backend server.
pub const SRV_ADMIN_STATE_READY: u32 = 4;

/// One parsed server-template slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub name: String,
    pub addr: String,
    pub op_state: u32,
    pub admin_state: u32,
}

impl SlotState {
    /// A slot is active iff it is operationally running and
    /// administratively enabled; anything else is a free slot.
    pub fn is_active(&self) -> bool {
        self.op_state == SRV_OP_STATE_RUNNING && self.admin_state == SRV_ADMIN_STATE_READY
    }
}

/// Parse a `show servers state <backend>` dump (already stripped of
/// blanks and comments). The first line is the format version.
pub fn parse_server_state(lines: &[String]) -> Result<Vec<SlotState>, HaproxyError> {
    let (version, servers) = lines
        .split_first()
        .ok_or_else(|| HaproxyError::Protocol("empty server-state response".to_string()))?;

    if version.trim() != STATE_FORMAT_VERSION {
        return Err(HaproxyError::UnsupportedVersion(version.trim().to_string()));
    }

    servers.iter().map(|line| parse_server_line(line)).collect()
}

fn parse_server_line(line: &str) -> Result<SlotState, HaproxyError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != SERVER_STATE_FIELDS {
        return Err(HaproxyError::Protocol(format!(
            "server line has {} fields, expected {SERVER_STATE_FIELDS}: {line:?}",
            fields.len()
        )));
    }

    let numeric = |index: usize, what: &str| {
        fields[index].parse::<u32>().map_err(|_| {
            HaproxyError::Protocol(format!("bad {what} {:?} in line {line:?}", fields[index]))
        })
    };

    Ok(SlotState {
        name: fields[3].to_string(),
        addr: fields[4].to_string(),
        op_state: numeric(5, "srv_op_state")?,
        admin_state: numeric(6, "srv_admin_state")?,
    })
}

/// The slot projection for one backend: addresses with their bound
/// slots, plus the pool of free slot names.
///
/// Read once per reconcile; writers mutate it in place so two adds
/// within one reconcile never hand out the same slot.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SlotTable {
    free: Vec<String>,
    bound: BTreeMap<String, Vec<String>>,
}

impl SlotTable {
    pub fn from_slots(slots: Vec<SlotState>) -> Self {
        let mut table = SlotTable::default();
        for slot in slots {
            if slot.is_active() {
                table.bound.entry(slot.addr).or_default().push(slot.name);
            } else {
                table.free.push(slot.name);
            }
        }
        table
    }

    /// Addresses currently bound to at least one active slot.
    pub fn members(&self) -> BTreeSet<String> {
        self.bound.keys().cloned().collect()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn slots_for(&self, addr: &str) -> &[String] {
        self.bound.get(addr).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn take_free(&mut self) -> Option<String> {
        self.free.pop()
    }

    pub(crate) fn return_free(&mut self, slot: String) {
        self.free.push(slot);
    }

    pub(crate) fn bind(&mut self, addr: &str, slot: String) {
        self.bound.entry(addr.to_string()).or_default().push(slot);
    }

    /// Drop the binding for one slot of `addr`, returning it to the
    /// free pool.
    pub(crate) fn release(&mut self, addr: &str, slot: &str) {
        if let Some(slots) = self.bound.get_mut(addr) {
            slots.retain(|s| s != slot);
            if slots.is_empty() {
                self.bound.remove(addr);
            }
        }
        self.free.push(slot.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(name: &str, addr: &str, op: u32, admin: u32) -> String {
        format!("3 nodes 1 {name} {addr} {op} {admin} 1 1 5 15 3 4 6 0 0 0 - 80")
    }

    fn dump(servers: &[String]) -> Vec<String> {
        let mut lines = vec!["1".to_string()];
        lines.extend_from_slice(servers);
        lines
    }

    #[test]
    fn parses_active_and_free_slots() {
        let slots = parse_server_state(&dump(&[
            line("member1", "10.0.0.5", 2, 4),
            line("member2", "127.0.0.1", 0, 5),
        ]))
        .unwrap();

        assert!(slots[0].is_active());
        assert!(!slots[1].is_active());
    }

    #[test]
    fn ready_state_requires_both_encodings() {
        assert!(!SlotState {
            name: "m".to_string(),
            addr: "10.0.0.5".to_string(),
            op_state: 2,
            admin_state: 5,
        }
        .is_active());
        assert!(!SlotState {
            name: "m".to_string(),
            addr: "10.0.0.5".to_string(),
            op_state: 0,
            admin_state: 4,
        }
        .is_active());
    }

    #[test]
    fn rejects_unknown_format_version() {
        let err = parse_server_state(&["2".to_string()]).unwrap_err();
        assert!(matches!(err, HaproxyError::UnsupportedVersion(v) if v == "2"));
    }

    #[test]
    fn rejects_short_server_line() {
        let err =
            parse_server_state(&["1".to_string(), "3 nodes 1 member1".to_string()]).unwrap_err();
        assert!(matches!(err, HaproxyError::Protocol(_)));
    }

    #[test]
    fn rejects_non_numeric_state() {
        let bad = line("member1", "10.0.0.5", 2, 4).replace(" 2 4 ", " up 4 ");
        let err = parse_server_state(&dump(&[bad])).unwrap_err();
        assert!(matches!(err, HaproxyError::Protocol(_)));
    }

    #[test]
    fn table_buckets_by_address() {
        let table = SlotTable::from_slots(
            parse_server_state(&dump(&[
                line("member1", "10.0.0.5", 2, 4),
                line("member2", "10.0.0.5", 2, 4),
                line("member3", "10.0.0.6", 2, 4),
                line("member4", "127.0.0.1", 0, 5),
            ]))
            .unwrap(),
        );

        assert_eq!(table.slots_for("10.0.0.5").len(), 2);
        assert_eq!(table.slots_for("10.0.0.6"), ["member3"]);
        assert_eq!(table.free_count(), 1);
        assert_eq!(
            table.members(),
            BTreeSet::from(["10.0.0.5".to_string(), "10.0.0.6".to_string()])
        );
    }

    #[test]
    fn release_returns_slot_to_free_pool() {
        let mut table = SlotTable::from_slots(
            parse_server_state(&dump(&[line("member1", "10.0.0.5", 2, 4)])).unwrap(),
        );
        assert_eq!(table.free_count(), 0);

        table.release("10.0.0.5", "member1");
        assert_eq!(table.free_count(), 1);
        assert!(table.members().is_empty());
    }
}
