use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};

/// The parts of a DNS record the aggregator cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    /// PTR target name
    Ptr(String),
    Srv { target: String, port: u16 },
    Txt(Vec<String>),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// Any other record type, by numeric type code
    Unknown(u16),
}

/// A service being assembled during one query round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Owner name the record was created for
    pub name: String,
    /// SRV target
    pub host: String,
    pub addresses_v4: BTreeSet<Ipv4Addr>,
    pub addresses_v6: BTreeSet<Ipv6Addr>,
    /// 0 until an SRV record is seen
    pub port: u16,
    pub text: Vec<String>,
    pub ttl: u32,
    has_text: bool,
    emitted: bool,
}

impl ServiceRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// At least one address, a port and a TXT record (possibly empty)
    pub fn is_complete(&self) -> bool {
        (!self.addresses_v4.is_empty() || !self.addresses_v6.is_empty())
            && self.port != 0
            && self.has_text
    }

    pub fn has_text(&self) -> bool {
        self.has_text
    }

    pub fn is_emitted(&self) -> bool {
        self.emitted
    }
}

/// Handle to a record slot. Aliased names share one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey(usize);

/// Outcome of a single merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Merge {
    pub key: RecordKey,
    /// True only the first time the record becomes complete
    pub newly_complete: bool,
}

#[derive(Debug, Default)]
pub struct Aggregator {
    slots: Vec<ServiceRecord>,
    names: HashMap<String, usize>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one record owned by `owner`. Returns `None` for record types
    /// that carry nothing about services.
    pub fn merge(&mut self, owner: &str, payload: &RecordPayload, ttl: u32) -> Option<Merge> {
        let slot = match payload {
            RecordPayload::Ptr(target) => {
                let slot = self.attach(target);
                self.slots[slot].ttl = ttl;
                slot
            }
            RecordPayload::Srv { target, port } => {
                let slot = self.attach(owner);
                if target != owner {
                    self.alias(target, slot);
                }
                let record = &mut self.slots[slot];
                record.host = target.clone();
                record.port = *port;
                slot
            }
            RecordPayload::Txt(text) => {
                let slot = self.attach(owner);
                let record = &mut self.slots[slot];
                record.text = text.clone();
                record.has_text = true;
                slot
            }
            RecordPayload::A(addr) => {
                let slot = self.attach(owner);
                self.slots[slot].addresses_v4.insert(*addr);
                slot
            }
            RecordPayload::Aaaa(addr) => {
                let slot = self.attach(owner);
                self.slots[slot].addresses_v6.insert(*addr);
                slot
            }
            RecordPayload::Unknown(_) => return None,
        };

        let record = &mut self.slots[slot];
        let newly_complete = record.is_complete() && !record.emitted;
        if newly_complete {
            record.emitted = true;
        }

        Some(Merge {
            key: RecordKey(slot),
            newly_complete,
        })
    }

    pub fn record(&self, key: RecordKey) -> &ServiceRecord {
        &self.slots[key.0]
    }

    pub fn get(&self, name: &str) -> Option<&ServiceRecord> {
        self.names.get(name).map(|&slot| &self.slots[slot])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceRecord> {
        let slot = *self.names.get(name)?;
        Some(&mut self.slots[slot])
    }

    pub fn key(&self, name: &str) -> Option<RecordKey> {
        self.names.get(name).map(|&slot| RecordKey(slot))
    }

    /// Number of known names, aliases included
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn attach(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.names.get(name) {
            return slot;
        }
        let slot = self.slots.len();
        self.slots.push(ServiceRecord::new(name));
        self.names.insert(name.to_string(), slot);
        slot
    }

    /// Point `alias` at `slot`. A host-only record already created for the
    /// alias (A records that beat the SRV) hands its addresses over. A record
    /// belonging to another instance keeps everything; only the name moves.
    fn alias(&mut self, alias: &str, slot: usize) {
        let Some(previous) = self.names.insert(alias.to_string(), slot) else {
            return;
        };
        if previous == slot {
            return;
        }
        let host_only = {
            let record = &self.slots[previous];
            record.name == alias && record.port == 0
        };
        if !host_only {
            return;
        }

        let orphan = std::mem::take(&mut self.slots[previous].addresses_v4);
        self.slots[slot].addresses_v4.extend(orphan);
        let orphan = std::mem::take(&mut self.slots[previous].addresses_v6);
        self.slots[slot].addresses_v6.extend(orphan);
    }
}
