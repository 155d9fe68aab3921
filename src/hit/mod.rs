//! # Hits
//!
//! Immutable event records and their deterministic parameter encoding.
//!
//! - **Version**: 1.1.0
//! - **Since**: 0.1.0
//!
//! ## Changelog
//! - 1.1.0: Added transaction items and social interactions
//! - 1.0.0: Initial release with views, events, exceptions, timings and transactions

pub mod url_builder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use url_builder::{build_post_payload, build_post_url, COLLECT_PATH, PROTOCOL_VERSION};

/// Custom dimensions keyed by slot index (`cd<index>`)
pub type CustomDimensionMap = BTreeMap<u32, String>;

/// Custom metrics keyed by slot index (`cm<index>`)
pub type CustomMetricMap = BTreeMap<u32, String>;

/// Application context stamped on every hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub tracking_id: String,
    pub client_id: String,
    pub app_name: String,
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl AppInfo {
    pub fn new(
        tracking_id: impl Into<String>,
        client_id: impl Into<String>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        AppInfo {
            tracking_id: tracking_id.into(),
            client_id: client_id.into(),
            app_name: app_name.into(),
            app_version: app_version.into(),
            app_id: None,
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }
}

/// A purchase line within a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    pub name: String,
    pub sku: Option<String>,
    pub category: Option<String>,
    pub price: f64,
    pub quantity: i64,
}

/// Summary of an e-commerce transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub affiliation: Option<String>,
    pub revenue: f64,
    pub tax: f64,
    pub shipping: f64,
    pub currency: Option<String>,
}

/// What happened, with the parameters each kind requires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HitKind {
    ScreenView {
        screen_name: String,
    },
    Event {
        category: String,
        action: String,
        label: Option<String>,
        value: Option<i64>,
    },
    Exception {
        description: String,
        fatal: bool,
    },
    Timing {
        category: String,
        /// Elapsed time in milliseconds
        interval_ms: u64,
        name: String,
        label: Option<String>,
    },
    Transaction(Transaction),
    Item {
        transaction_id: String,
        item: TransactionItem,
        currency: Option<String>,
    },
    Social {
        network: String,
        action: String,
        target: Option<String>,
    },
}

impl HitKind {
    /// Measurement protocol hit type (`t` parameter)
    pub fn as_str(&self) -> &'static str {
        match self {
            HitKind::ScreenView { .. } => "screenview",
            HitKind::Event { .. } => "event",
            HitKind::Exception { .. } => "exception",
            HitKind::Timing { .. } => "timing",
            HitKind::Transaction(_) => "transaction",
            HitKind::Item { .. } => "item",
            HitKind::Social { .. } => "social",
        }
    }
}

impl std::fmt::Display for HitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded event.
///
/// A hit never changes after construction; the builder-style `with_*` methods
/// consume and return it, so they are only usable before it is handed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub app: AppInfo,
    pub kind: HitKind,
    #[serde(default)]
    pub dimensions: CustomDimensionMap,
    #[serde(default)]
    pub metrics: CustomMetricMap,
    pub timestamp: DateTime<Utc>,
}

impl Hit {
    pub fn new(app: AppInfo, kind: HitKind) -> Self {
        Hit {
            app,
            kind,
            dimensions: CustomDimensionMap::new(),
            metrics: CustomMetricMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn screen_view(app: AppInfo, screen_name: impl Into<String>) -> Self {
        Self::new(
            app,
            HitKind::ScreenView {
                screen_name: screen_name.into(),
            },
        )
    }

    pub fn event(
        app: AppInfo,
        category: impl Into<String>,
        action: impl Into<String>,
        label: Option<&str>,
        value: Option<i64>,
    ) -> Self {
        Self::new(
            app,
            HitKind::Event {
                category: category.into(),
                action: action.into(),
                label: label.map(String::from),
                value,
            },
        )
    }

    pub fn exception(app: AppInfo, description: impl Into<String>, fatal: bool) -> Self {
        Self::new(
            app,
            HitKind::Exception {
                description: description.into(),
                fatal,
            },
        )
    }

    pub fn timing(
        app: AppInfo,
        category: impl Into<String>,
        interval_ms: u64,
        name: impl Into<String>,
        label: Option<&str>,
    ) -> Self {
        Self::new(
            app,
            HitKind::Timing {
                category: category.into(),
                interval_ms,
                name: name.into(),
                label: label.map(String::from),
            },
        )
    }

    pub fn social(
        app: AppInfo,
        network: impl Into<String>,
        action: impl Into<String>,
        target: Option<&str>,
    ) -> Self {
        Self::new(
            app,
            HitKind::Social {
                network: network.into(),
                action: action.into(),
                target: target.map(String::from),
            },
        )
    }

    pub fn with_dimensions(mut self, dimensions: CustomDimensionMap) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_metrics(mut self, metrics: CustomMetricMap) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Ordered wire parameters for this hit.
    ///
    /// Parameter order is fixed per kind and custom slots follow in index
    /// order, so equal hits always encode to equal strings.
    pub fn parameters(&self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = Vec::with_capacity(16);
        let mut push = |key: &str, value: String| params.push((key.to_string(), value));

        push("v", PROTOCOL_VERSION.to_string());
        push("tid", self.app.tracking_id.clone());
        push("cid", self.app.client_id.clone());
        push("t", self.kind.as_str().to_string());
        push("an", self.app.app_name.clone());
        push("av", self.app.app_version.clone());
        if let Some(ref app_id) = self.app.app_id {
            push("aid", app_id.clone());
        }

        match &self.kind {
            HitKind::ScreenView { screen_name } => {
                push("cd", screen_name.clone());
            }
            HitKind::Event {
                category,
                action,
                label,
                value,
            } => {
                push("ec", category.clone());
                push("ea", action.clone());
                if let Some(label) = label {
                    push("el", label.clone());
                }
                if let Some(value) = value {
                    push("ev", value.to_string());
                }
            }
            HitKind::Exception { description, fatal } => {
                push("exd", description.clone());
                push("exf", if *fatal { "1" } else { "0" }.to_string());
            }
            HitKind::Timing {
                category,
                interval_ms,
                name,
                label,
            } => {
                push("utc", category.clone());
                push("utt", interval_ms.to_string());
                push("utv", name.clone());
                if let Some(label) = label {
                    push("utl", label.clone());
                }
            }
            HitKind::Transaction(transaction) => {
                push("ti", transaction.id.clone());
                if let Some(ref affiliation) = transaction.affiliation {
                    push("ta", affiliation.clone());
                }
                push("tr", format_amount(transaction.revenue));
                push("ts", format_amount(transaction.shipping));
                push("tt", format_amount(transaction.tax));
                if let Some(ref currency) = transaction.currency {
                    push("cu", currency.clone());
                }
            }
            HitKind::Item {
                transaction_id,
                item,
                currency,
            } => {
                push("ti", transaction_id.clone());
                push("in", item.name.clone());
                push("ip", format_amount(item.price));
                push("iq", item.quantity.to_string());
                if let Some(ref sku) = item.sku {
                    push("ic", sku.clone());
                }
                if let Some(ref category) = item.category {
                    push("iv", category.clone());
                }
                if let Some(currency) = currency {
                    push("cu", currency.clone());
                }
            }
            HitKind::Social {
                network,
                action,
                target,
            } => {
                push("sn", network.clone());
                push("sa", action.clone());
                if let Some(target) = target {
                    push("st", target.clone());
                }
            }
        }

        for (index, value) in &self.dimensions {
            push(&format!("cd{index}"), value.clone());
        }
        for (index, value) in &self.metrics {
            push(&format!("cm{index}"), value.clone());
        }

        params
    }
}

/// Currency amounts always carry two decimals
fn format_amount(amount: f64) -> String {
    format!("{amount:.2}")
}
