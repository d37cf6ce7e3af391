//! Feishu messaging surface: IM API client and webhook handling.

mod api;
pub mod webhook;

pub use api::{FeishuClient, FeishuError};
pub use webhook::EventDeduper;
