use crate::error::PulseError;
use crate::types::Sample;
use futures::future::BoxFuture;
use std::collections::BTreeMap;

/// Requested channel paths, keyed by group code.
pub type ChannelsByGroup = BTreeMap<String, Vec<String>>;

/// A source of raw samples. Wire protocols and polling schedules live behind this trait.
pub trait Connector: std::fmt::Debug + Send + Sync {
    fn query(&self, channels: &ChannelsByGroup) -> BoxFuture<'static, Result<Vec<Sample>, PulseError>>;
}
