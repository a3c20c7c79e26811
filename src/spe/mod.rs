//! ARM SPE sampling: aux-buffer pipeline (§4.4) and packet decoder (§4.5).

pub mod aux_buffer;
pub mod decoder;

pub use aux_buffer::{ContextSwitch, SpeReadOutcome, SpeSampler};
pub use decoder::{fixup_va, SpeRecord};
