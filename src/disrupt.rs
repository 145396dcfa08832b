//! Fault injection at named points of the commit protocol.

use crate::error::SectorStoreError;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

pub const FOLDER_PREPARE: &str = "folder prepare";
pub const FOLDER_PROCESS: &str = "folder process";
pub const PHYSICAL_PREPARE: &str = "physical prepare";
pub const PHYSICAL_PROCESS: &str = "physical process";
pub const VIRTUAL_PREPARE: &str = "virtual prepare";
pub const VIRTUAL_PROCESS: &str = "virtual process";
pub const REMOVE_PREPARE: &str = "remove prepare";
pub const REMOVE_PROCESS: &str = "remove process";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disruption {
    /// The operation fails and rolls back in process.
    Fail,
    /// The operation stops dead, leaving its transaction in the log as a
    /// killed process would.
    Crash,
}

type Trigger = Arc<dyn Fn() -> Option<Disruption> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Disrupter {
    points: HashMap<&'static str, Trigger>,
}

impl Disrupter {
    pub fn new() -> Disrupter {
        Disrupter::default()
    }

    /// Always disrupt at `keyword`.
    pub fn register(self, keyword: &'static str, disruption: Disruption) -> Disrupter {
        self.register_with(keyword, move || Some(disruption))
    }

    /// Disrupt at `keyword` whenever `trigger` says so.
    pub fn register_with(
        mut self,
        keyword: &'static str,
        trigger: impl Fn() -> Option<Disruption> + Send + Sync + 'static,
    ) -> Disrupter {
        self.points.insert(keyword, Arc::new(trigger));
        self
    }

    pub(crate) fn disrupt(&self, keyword: &'static str) -> Result<()> {
        match self.points.get(keyword).and_then(|trigger| trigger()) {
            None => Ok(()),
            Some(Disruption::Fail) => Err(SectorStoreError::Disrupted(keyword.to_string())),
            Some(Disruption::Crash) => Err(SectorStoreError::Crashed(keyword.to_string())),
        }
    }
}
