// WhatsApp Connection Engine
// Per-bot multi-device connection supervision, the SQLite store it writes
// paired sessions into, and the on-disk layout both share.

pub mod paths;
pub mod sessions;
pub mod whatsapp;
