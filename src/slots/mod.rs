pub mod pack;
pub mod pack_manager;
pub mod persistence;
pub mod scheduler;
pub mod types;

pub use pack_manager::{parse_slot_id, SlotPackManager, DEFAULT_PACK_MAX_AGE_MS};
pub use persistence::SlotPackStore;
pub use scheduler::SlotScheduler;
pub use types::{
    slot_id, DecodeHistoryEntry, FrameMessage, SlotInfo, SlotPack, SlotPackStats,
    SlotPackStorageRecord, StorageOperation, STORAGE_RECORD_VERSION, TRANSMIT_SNR,
};
