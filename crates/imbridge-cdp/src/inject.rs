//! Observation injector: installs capture mechanisms into the attached page
//! and drains the shared buffer they feed.

use imbridge_core::CapturedEvent;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CdpError;
use crate::page::PageEvaluator;
use crate::scripts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMechanism {
    StateSubscription,
    DomObserver,
}

impl CaptureMechanism {
    pub fn name(self) -> &'static str {
        match self {
            Self::StateSubscription => "store",
            Self::DomObserver => "dom",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "store" => Some(Self::StateSubscription),
            "dom" => Some(Self::DomObserver),
            _ => None,
        }
    }
}

/// One installable capture mechanism. `installer` is a JS function
/// expression taking the shared context and returning a teardown function,
/// or null when the mechanism is unavailable in this page.
pub trait CaptureSource: Send + Sync {
    fn mechanism(&self) -> CaptureMechanism;
    fn installer(&self) -> &str;
}

pub struct StoreSubscription;

impl CaptureSource for StoreSubscription {
    fn mechanism(&self) -> CaptureMechanism {
        CaptureMechanism::StateSubscription
    }

    fn installer(&self) -> &str {
        scripts::STORE_INSTALLER
    }
}

pub struct DomObserver;

impl CaptureSource for DomObserver {
    fn mechanism(&self) -> CaptureMechanism {
        CaptureMechanism::DomObserver
    }

    fn installer(&self) -> &str {
        scripts::DOM_INSTALLER
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub mechanisms: Vec<CaptureMechanism>,
    /// The page already carried the capture logic; nothing was installed.
    pub reused: bool,
}

#[derive(Debug, Deserialize)]
struct InstallReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    reused: bool,
    #[serde(default)]
    mechanisms: Vec<String>,
}

pub struct Injector {
    sources: Vec<Box<dyn CaptureSource>>,
}

impl Default for Injector {
    fn default() -> Self {
        Self::new(vec![Box::new(StoreSubscription), Box::new(DomObserver)])
    }
}

impl Injector {
    pub fn new(sources: Vec<Box<dyn CaptureSource>>) -> Self {
        Self { sources }
    }

    pub fn mechanisms(&self) -> Vec<CaptureMechanism> {
        self.sources.iter().map(|s| s.mechanism()).collect()
    }

    pub fn script(&self, force: bool) -> String {
        let installers: Vec<(&str, &str)> = self
            .sources
            .iter()
            .map(|s| (s.mechanism().name(), s.installer()))
            .collect();
        scripts::install_script(force, &installers)
    }

    /// Install into `page`. Idempotent unless `force`, which tears down the
    /// previous install first.
    pub async fn install(
        &self,
        page: &dyn PageEvaluator,
        force: bool,
    ) -> Result<InstallReport, CdpError> {
        let value = page.evaluate(&self.script(force), false).await?;
        let reply: InstallReply = serde_json::from_value(value)
            .map_err(|e| CdpError::Decode(format!("install reply: {e}")))?;
        if !reply.ok {
            return Err(CdpError::InjectionFailed(
                "no capture mechanism could be installed".into(),
            ));
        }
        let mechanisms = reply
            .mechanisms
            .iter()
            .filter_map(|m| CaptureMechanism::from_name(m))
            .collect();
        Ok(InstallReport {
            mechanisms,
            reused: reply.reused,
        })
    }

    /// Take everything buffered since the last drain. `None` when the page
    /// no longer carries the capture logic.
    pub async fn drain(&self, page: &dyn PageEvaluator) -> Result<Option<Vec<CapturedEvent>>, CdpError> {
        let value = page.evaluate(scripts::DRAIN, false).await?;
        Ok(parse_batch(value))
    }
}

fn parse_batch(value: Value) -> Option<Vec<CapturedEvent>> {
    let Value::Array(items) = value else {
        return None;
    };
    let events = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<CapturedEvent>(item) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!("skipping malformed capture record: {e}");
                None
            }
        })
        .collect();
    Some(events)
}
