//! Candidate relay servers: entry model, ordered store, last-connected stamp

mod entry;
mod last_connected;
mod store;

pub use entry::{
    MeekFronting, MeekParams, ServerEntry, ServerEntryFields, CAPABILITY_FRONTED_MEEK,
    CAPABILITY_HANDSHAKE, CAPABILITY_OSSH, CAPABILITY_SSH, CAPABILITY_UNFRONTED_MEEK,
    CAPABILITY_UNFRONTED_MEEK_HTTPS, CAPABILITY_VPN, DEFAULT_CAPABILITIES, MEEK_CAPABILITIES,
    SUFFICIENT_CAPABILITIES_FOR_TUNNEL,
};
pub use last_connected::LastConnected;
#[cfg(test)]
pub(crate) use entry::tests as entry_fixtures;
pub use store::{MergeSource, MergeStats, ServerEntryStore, MAX_SAVED_ENTRIES_SIZE};

/// File name of the persisted server list inside the data directory
pub const SERVER_ENTRIES_FILE: &str = "server_entries.json";

/// File name of the last successful connection stamp
pub const LAST_CONNECTED_FILE: &str = "last_connected";
