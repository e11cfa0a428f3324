use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::tools::{ParamSpec, ParamType, Tool, ToolArguments, ToolSpec};

pub const TOOL_NAME: &str = "delivery_tracker";

// Either a reference introduced by a keyword, or a message that is nothing
// but a reference (a reply to "what's your tracking number?").
const ORDER_ID_PATTERN: &str = concat!(
    r"\b(?:order|tracking|shipment|package|parcel)\b(?:\s+(?:number|no|id))?\s*[:#]?\s*([a-z0-9-]*\d[a-z0-9-]*)",
    r"|^\s*#?([a-z-]{0,4}\d[a-z0-9-]{4,20})\s*[.!?]?\s*$",
);

const STAGES: [(&str, &str); 4] = [
    ("processing", "Fulfilment centre"),
    ("in_transit", "Regional sort facility"),
    ("out_for_delivery", "Local delivery depot"),
    ("delivered", "Recipient address"),
];

/// Simulated carrier lookup. The status is derived from the order id so the
/// same id always reports the same stage.
#[derive(Clone, Debug)]
pub struct DeliveryTracker {
    carrier: String,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self { carrier: "Parley Express".to_string() }
    }
}

impl DeliveryTracker {
    pub fn new(carrier: impl Into<String>) -> Self {
        Self { carrier: carrier.into() }
    }
}

#[async_trait]
impl Tool for DeliveryTracker {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            TOOL_NAME,
            "Track the delivery status of an order, package, parcel or shipment",
        )
            .with_trigger(r"\b(?:track|trace)(?:ing)?\b")
            .with_trigger(r"\bwhere(?:'s|\s+is)\s+my\b")
            .with_trigger(r"\b(?:delivery|shipping)\s+status\b")
            .with_trigger(r"\bhas\s+my\s+\w+\s+(?:shipped|arrived)\b")
            .with_parameter(
                "order_id",
                ParamSpec::required(ParamType::String, "Order or tracking number")
                    .with_pattern(ORDER_ID_PATTERN),
            )
    }

    async fn run(&self, arguments: ToolArguments) -> Result<Value> {
        let Some(order_id) = arguments.get("order_id").and_then(Value::as_str) else {
            bail!("order_id argument is missing");
        };
        let order_id = order_id.trim();
        if !(4..=25).contains(&order_id.len()) {
            bail!("order `{order_id}` is not a valid tracking reference");
        }

        let checksum: usize = order_id.bytes().map(usize::from).sum();
        let stage = checksum % STAGES.len();
        let (status, location) = STAGES[stage];
        let days_remaining = (STAGES.len() - 1 - stage) as i64;
        let estimated = Utc::now().date_naive() + Duration::days(days_remaining);

        Ok(json!({
            "order_id": order_id,
            "status": status,
            "carrier": self.carrier,
            "last_location": location,
            "estimated_delivery": estimated.to_string(),
        }))
    }
}
