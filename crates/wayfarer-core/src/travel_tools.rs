//! Built-in travel tools.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wayfarer_schema::AuthLevel;

use crate::rate_limit::RateLimiter;
use crate::tool::{
    RegistryError, ToolContext, ToolDescriptor, ToolHandler, ToolOutput, ToolRegistry,
};

pub const CONVERT_UNITS_TOOL_NAME: &str = "convert_units";
pub const RECORD_EXPENSE_TOOL_NAME: &str = "record_expense";
pub const TRIP_EXPENSES_TOOL_NAME: &str = "trip_expenses";
pub const RESET_RATE_LIMIT_TOOL_NAME: &str = "reset_rate_limit";

const MAX_EXPENSE_AMOUNT: f64 = 100_000.0;

/// Register every built-in tool.
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    ledger: ExpenseLedger,
    rate_limiter: RateLimiter,
) -> Result<(), RegistryError> {
    registry.register(ConvertUnitsTool.descriptor()?)?;
    registry.register(RecordExpenseTool::new(ledger.clone()).descriptor()?)?;
    registry.register(TripExpensesTool::new(ledger).descriptor()?)?;
    registry.register(ResetRateLimitTool::new(rate_limiter).descriptor()?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// convert_units
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Unit {
    Km,
    Mi,
    C,
    F,
    Kg,
    Lb,
    L,
    Gal,
}

impl Unit {
    fn symbol(self) -> &'static str {
        match self {
            Self::Km => "km",
            Self::Mi => "mi",
            Self::C => "°C",
            Self::F => "°F",
            Self::Kg => "kg",
            Self::Lb => "lb",
            Self::L => "l",
            Self::Gal => "gal",
        }
    }

    fn dimension(self) -> &'static str {
        match self {
            Self::Km | Self::Mi => "distance",
            Self::C | Self::F => "temperature",
            Self::Kg | Self::Lb => "mass",
            Self::L | Self::Gal => "volume",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConvertInput {
    value: f64,
    from: Unit,
    to: Unit,
}

fn convert(value: f64, from: Unit, to: Unit) -> Option<f64> {
    use Unit::*;
    const KM_PER_MI: f64 = 1.609_344;
    const KG_PER_LB: f64 = 0.453_592_37;
    const L_PER_GAL: f64 = 3.785_411_784;

    if from == to {
        return Some(value);
    }
    match (from, to) {
        (Mi, Km) => Some(value * KM_PER_MI),
        (Km, Mi) => Some(value / KM_PER_MI),
        (C, F) => Some(value * 9.0 / 5.0 + 32.0),
        (F, C) => Some((value - 32.0) * 5.0 / 9.0),
        (Lb, Kg) => Some(value * KG_PER_LB),
        (Kg, Lb) => Some(value / KG_PER_LB),
        (Gal, L) => Some(value * L_PER_GAL),
        (L, Gal) => Some(value / L_PER_GAL),
        _ => None,
    }
}

pub struct ConvertUnitsTool;

impl ConvertUnitsTool {
    pub fn descriptor(self) -> Result<ToolDescriptor, RegistryError> {
        ToolDescriptor::new(
            CONVERT_UNITS_TOOL_NAME,
            "Convert a value between travel units: km/mi, c/f, kg/lb, l/gal.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "value": {"type": "number", "description": "Value to convert"},
                    "from": {"type": "string", "enum": ["km", "mi", "c", "f", "kg", "lb", "l", "gal"]},
                    "to": {"type": "string", "enum": ["km", "mi", "c", "f", "kg", "lb", "l", "gal"]}
                },
                "required": ["value", "from", "to"],
                "additionalProperties": false
            }),
            AuthLevel::Public,
            Arc::new(self),
        )
    }
}

#[async_trait]
impl ToolHandler for ConvertUnitsTool {
    fn validate(&self, args: &serde_json::Value) -> Result<(), String> {
        let input: ConvertInput =
            serde_json::from_value(args.clone()).map_err(|e| e.to_string())?;
        if input.from.dimension() != input.to.dimension() {
            return Err(format!(
                "cannot convert {} to {}",
                input.from.dimension(),
                input.to.dimension()
            ));
        }
        Ok(())
    }

    async fn execute(&self, args: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let input: ConvertInput = serde_json::from_value(args)?;
        let converted = convert(input.value, input.from, input.to)
            .ok_or_else(|| anyhow!("unsupported conversion"))?;
        Ok(ToolOutput::ok(format!(
            "{} {} = {:.2} {}",
            input.value,
            input.from.symbol(),
            converted,
            input.to.symbol()
        )))
    }
}

// ---------------------------------------------------------------------------
// Expense ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Expense {
    pub trip: String,
    pub amount: f64,
    pub currency: String,
    pub category: String,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// In-process, per-user expense records.
#[derive(Clone, Default)]
pub struct ExpenseLedger {
    entries: Arc<Mutex<HashMap<String, Vec<Expense>>>>,
}

impl ExpenseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many expenses the user now has on that trip.
    pub fn record(&self, user_id: &str, expense: Expense) -> Result<usize> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("expense ledger unavailable"))?;
        let list = entries.entry(user_id.to_string()).or_default();
        let trip = expense.trip.clone();
        list.push(expense);
        Ok(list.iter().filter(|e| e.trip.eq_ignore_ascii_case(&trip)).count())
    }

    pub fn expenses(&self, user_id: &str, trip: Option<&str>) -> Result<Vec<Expense>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("expense ledger unavailable"))?;
        Ok(entries
            .get(user_id)
            .map(|list| {
                list.iter()
                    .filter(|e| trip.is_none_or(|t| e.trip.eq_ignore_ascii_case(t)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Totals per currency, sorted by currency code.
    pub fn totals(&self, user_id: &str, trip: Option<&str>) -> Result<BTreeMap<String, f64>> {
        let mut totals = BTreeMap::new();
        for e in self.expenses(user_id, trip)? {
            *totals.entry(e.currency).or_insert(0.0) += e.amount;
        }
        Ok(totals)
    }
}

// ---------------------------------------------------------------------------
// record_expense
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RecordExpenseInput {
    trip: String,
    amount: f64,
    currency: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    note: Option<String>,
}

fn default_category() -> String {
    "other".to_string()
}

pub struct RecordExpenseTool {
    ledger: ExpenseLedger,
}

impl RecordExpenseTool {
    pub fn new(ledger: ExpenseLedger) -> Self {
        Self { ledger }
    }

    pub fn descriptor(self) -> Result<ToolDescriptor, RegistryError> {
        Ok(ToolDescriptor::new(
            RECORD_EXPENSE_TOOL_NAME,
            "Record an expense against one of the traveler's trips.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "trip": {"type": "string", "minLength": 1, "maxLength": 80},
                    "amount": {"type": "number", "exclusiveMinimum": 0, "maximum": MAX_EXPENSE_AMOUNT},
                    "currency": {"type": "string", "pattern": "^[A-Z]{3}$", "description": "ISO 4217 code"},
                    "category": {
                        "type": "string",
                        "enum": ["lodging", "food", "transport", "activities", "other"]
                    },
                    "note": {"type": "string", "maxLength": 200}
                },
                "required": ["trip", "amount", "currency"],
                "additionalProperties": false
            }),
            AuthLevel::Authenticated,
            Arc::new(self),
        )?
        .heavy())
    }
}

#[async_trait]
impl ToolHandler for RecordExpenseTool {
    fn validate(&self, args: &serde_json::Value) -> Result<(), String> {
        let trip = args["trip"].as_str().unwrap_or_default();
        if trip.trim().is_empty() {
            return Err("trip must not be blank".into());
        }
        Ok(())
    }

    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: RecordExpenseInput = serde_json::from_value(args)?;
        if !(input.amount > 0.0 && input.amount <= MAX_EXPENSE_AMOUNT) {
            return Ok(ToolOutput::error("amount out of range"));
        }
        let expense = Expense {
            trip: input.trip.trim().to_string(),
            amount: input.amount,
            currency: input.currency,
            category: input.category,
            note: input.note,
            recorded_at: Utc::now(),
        };
        let summary = format!(
            "Recorded {:.2} {} for {} on trip '{}'",
            expense.amount, expense.currency, expense.category, expense.trip
        );
        let count = self.ledger.record(&ctx.user_id, expense)?;
        Ok(ToolOutput::ok(format!(
            "{summary} ({count} expense{} on this trip)",
            if count == 1 { "" } else { "s" }
        )))
    }
}

// ---------------------------------------------------------------------------
// trip_expenses
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TripExpensesInput {
    #[serde(default)]
    trip: Option<String>,
}

pub struct TripExpensesTool {
    ledger: ExpenseLedger,
}

impl TripExpensesTool {
    pub fn new(ledger: ExpenseLedger) -> Self {
        Self { ledger }
    }

    pub fn descriptor(self) -> Result<ToolDescriptor, RegistryError> {
        ToolDescriptor::new(
            TRIP_EXPENSES_TOOL_NAME,
            "Summarize recorded expenses, optionally for a single trip, with totals by currency.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "trip": {"type": "string", "minLength": 1}
                },
                "additionalProperties": false
            }),
            AuthLevel::Authenticated,
            Arc::new(self),
        )
    }
}

#[async_trait]
impl ToolHandler for TripExpensesTool {
    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: TripExpensesInput = serde_json::from_value(args)?;
        let trip = input.trip.as_deref().map(str::trim);
        let expenses = self.ledger.expenses(&ctx.user_id, trip)?;
        if expenses.is_empty() {
            return Ok(ToolOutput::ok(match trip {
                Some(t) => format!("No expenses recorded for trip '{t}'."),
                None => "No expenses recorded yet.".to_string(),
            }));
        }
        let totals = self.ledger.totals(&ctx.user_id, trip)?;
        let body = serde_json::json!({
            "trip": trip,
            "count": expenses.len(),
            "totals": totals
                .iter()
                .map(|(currency, total)| (currency.clone(), (total * 100.0).round() / 100.0))
                .collect::<BTreeMap<_, _>>(),
        });
        Ok(ToolOutput::ok(body.to_string()))
    }
}

// ---------------------------------------------------------------------------
// reset_rate_limit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ResetRateLimitInput {
    user_id: String,
}

pub struct ResetRateLimitTool {
    rate_limiter: RateLimiter,
}

impl ResetRateLimitTool {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self { rate_limiter }
    }

    pub fn descriptor(self) -> Result<ToolDescriptor, RegistryError> {
        ToolDescriptor::new(
            RESET_RATE_LIMIT_TOOL_NAME,
            "Clear all rate-limit buckets for a user.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "user_id": {"type": "string", "minLength": 1}
                },
                "required": ["user_id"],
                "additionalProperties": false
            }),
            AuthLevel::Admin,
            Arc::new(self),
        )
    }
}

#[async_trait]
impl ToolHandler for ResetRateLimitTool {
    async fn execute(&self, args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let input: ResetRateLimitInput = serde_json::from_value(args)?;
        let cleared = self.rate_limiter.reset(&input.user_id);
        tracing::info!(
            target: crate::audit::AUDIT_TARGET,
            admin = %ctx.user_id,
            subject = %input.user_id,
            cleared,
            "rate limits reset"
        );
        Ok(ToolOutput::ok(format!(
            "Cleared {cleared} rate-limit bucket(s) for {}",
            input.user_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RateLimitsConfig;
    use crate::dispatcher::ToolDispatcher;
    use crate::rate_limit::EndpointClass;
    use crate::tool::ToolError;

    fn setup() -> (ToolDispatcher, ExpenseLedger, RateLimiter) {
        let ledger = ExpenseLedger::new();
        let limiter = RateLimiter::new(RateLimitsConfig::default());
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, ledger.clone(), limiter.clone()).unwrap();
        let dispatcher =
            ToolDispatcher::new(Arc::new(registry), Duration::from_secs(5), 10)
                .with_rate_limiter(limiter.clone());
        (dispatcher, ledger, limiter)
    }

    #[test]
    fn conversions() {
        let mi = convert(10.0, Unit::Km, Unit::Mi).unwrap();
        assert!((mi - 6.2137).abs() < 1e-3);
        assert_eq!(convert(100.0, Unit::C, Unit::F), Some(212.0));
        assert!((convert(1.0, Unit::Gal, Unit::L).unwrap() - 3.7854).abs() < 1e-3);
        assert_eq!(convert(5.0, Unit::Kg, Unit::Kg), Some(5.0));
        assert_eq!(convert(5.0, Unit::Kg, Unit::Km), None);
    }

    #[tokio::test]
    async fn convert_units_is_public() {
        let (d, _, _) = setup();
        let mut budget = d.begin_turn();
        let out = d
            .invoke(
                &mut budget,
                &ToolContext::new("anon", AuthLevel::Public),
                CONVERT_UNITS_TOOL_NAME,
                serde_json::json!({"value": 100, "from": "c", "to": "f"}),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "100 °C = 212.00 °F");
    }

    #[tokio::test]
    async fn convert_units_rejects_mixed_dimensions() {
        let (d, _, _) = setup();
        let mut budget = d.begin_turn();
        let err = d
            .invoke(
                &mut budget,
                &ToolContext::new("anon", AuthLevel::Public),
                CONVERT_UNITS_TOOL_NAME,
                serde_json::json!({"value": 1, "from": "kg", "to": "mi"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
    }

    #[tokio::test]
    async fn record_and_summarize_expenses() {
        let (d, ledger, _) = setup();
        let ctx = ToolContext::new("traveler", AuthLevel::Authenticated);
        let mut budget = d.begin_turn();
        for (amount, currency) in [(45.5, "EUR"), (20.0, "EUR"), (12.0, "USD")] {
            d.invoke(
                &mut budget,
                &ctx,
                RECORD_EXPENSE_TOOL_NAME,
                serde_json::json!({"trip": "Rome", "amount": amount, "currency": currency, "category": "food"}),
            )
            .await
            .unwrap();
        }
        let totals = ledger.totals("traveler", Some("rome")).unwrap();
        assert_eq!(totals.get("EUR"), Some(&65.5));
        assert_eq!(totals.get("USD"), Some(&12.0));

        let out = d
            .invoke(&mut budget, &ctx, TRIP_EXPENSES_TOOL_NAME, serde_json::json!({"trip": "Rome"}))
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(body["count"], 3);
        assert_eq!(body["totals"]["EUR"], 65.5);

        assert!(ledger.expenses("someone-else", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_expense_range_is_enforced() {
        let (d, ledger, _) = setup();
        let ctx = ToolContext::new("traveler", AuthLevel::Authenticated);
        for amount in [0.0, -3.0, 100_000.01] {
            let mut budget = d.begin_turn();
            let err = d
                .invoke(
                    &mut budget,
                    &ctx,
                    RECORD_EXPENSE_TOOL_NAME,
                    serde_json::json!({"trip": "Oslo", "amount": amount, "currency": "NOK"}),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ToolError::Validation { .. }), "amount {amount}");
        }
        assert!(ledger.expenses("traveler", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_expense_requires_authentication() {
        let (d, ledger, _) = setup();
        let mut budget = d.begin_turn();
        let err = d
            .invoke(
                &mut budget,
                &ToolContext::new("anon", AuthLevel::Public),
                RECORD_EXPENSE_TOOL_NAME,
                serde_json::json!({"trip": "Oslo", "amount": 10, "currency": "NOK"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unauthorized { .. }));
        assert!(ledger.expenses("anon", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_can_reset_rate_limits() {
        let (d, _, limiter) = setup();
        for _ in 0..25 {
            limiter.check("noisy", EndpointClass::Chat);
        }
        assert!(!limiter.check("noisy", EndpointClass::Chat).is_allowed());

        let mut budget = d.begin_turn();
        let out = d
            .invoke(
                &mut budget,
                &ToolContext::new("ops", AuthLevel::Admin),
                RESET_RATE_LIMIT_TOOL_NAME,
                serde_json::json!({"user_id": "noisy"}),
            )
            .await
            .unwrap();
        assert!(out.content.contains("Cleared 1"));
        assert!(limiter.check("noisy", EndpointClass::Chat).is_allowed());
    }

    #[test]
    fn builtin_tools_are_advertised_by_level() {
        let (d, _, _) = setup();
        let public: Vec<_> = d
            .registry()
            .tool_defs_for(AuthLevel::Public)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(public, vec![CONVERT_UNITS_TOOL_NAME]);
        assert_eq!(d.registry().tool_defs_for(AuthLevel::Authenticated).len(), 3);
        assert_eq!(d.registry().tool_defs_for(AuthLevel::Admin).len(), 4);
    }
}
