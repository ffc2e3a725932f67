//! Built-in financial tools
//!
//! They operate on an in-memory `FinanceSnapshot` standing in for the
//! dashboard's data services.

use super::{optional_f64, require_f64, require_str, Tool, ToolRegistry};
use crate::error::OrchestrationError;
use crate::models::JsonMap;
use crate::Result;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

const MAX_SIMULATION_YEARS: f64 = 60.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Checking,
    Savings,
    Investment,
    Credit,
    Loan,
}

impl AccountKind {
    fn is_liability(self) -> bool {
        matches!(self, AccountKind::Credit | AccountKind::Loan)
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "checking" => Some(AccountKind::Checking),
            "savings" => Some(AccountKind::Savings),
            "investment" | "brokerage" => Some(AccountKind::Investment),
            "credit" | "credit_card" => Some(AccountKind::Credit),
            "loan" => Some(AccountKind::Loan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub kind: AccountKind,
    /// Amount owed for liabilities, held amount otherwise
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialGoal {
    pub id: Uuid,
    pub name: String,
    pub target_amount: f64,
    pub current_amount: f64,
    pub target_date: Option<NaiveDate>,
    pub created_at: chrono::DateTime<Utc>,
}

/// The user's financial position as seen by the tools
#[derive(Debug)]
pub struct FinanceSnapshot {
    pub accounts: Vec<Account>,
    pub monthly_income: f64,
    /// Last month's spending per category
    pub spending: BTreeMap<String, f64>,
    goals: RwLock<Vec<FinancialGoal>>,
}

impl FinanceSnapshot {
    pub fn new(accounts: Vec<Account>, monthly_income: f64, spending: BTreeMap<String, f64>) -> Self {
        Self {
            accounts,
            monthly_income,
            spending,
            goals: RwLock::new(Vec::new()),
        }
    }

    /// Sample household used by the demo and the default registry
    pub fn sample() -> Self {
        let accounts = vec![
            account("Everyday Checking", AccountKind::Checking, 8_500.0),
            account("High-Yield Savings", AccountKind::Savings, 21_500.0),
            account("Brokerage", AccountKind::Investment, 35_000.0),
            account("Rewards Card", AccountKind::Credit, 3_000.0),
            account("Car Loan", AccountKind::Loan, 12_000.0),
        ];

        let spending = [
            ("Housing", 1_850.0),
            ("Groceries", 620.0),
            ("Transportation", 410.0),
            ("Dining", 280.0),
            ("Utilities", 190.0),
            ("Entertainment", 150.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self::new(accounts, 6_200.0, spending)
    }

    pub fn total_assets(&self) -> f64 {
        self.accounts
            .iter()
            .filter(|a| !a.kind.is_liability())
            .map(|a| a.balance)
            .sum()
    }

    pub fn total_liabilities(&self) -> f64 {
        self.accounts
            .iter()
            .filter(|a| a.kind.is_liability())
            .map(|a| a.balance)
            .sum()
    }

    pub fn net_worth(&self) -> f64 {
        self.total_assets() - self.total_liabilities()
    }

    pub fn monthly_expenses(&self) -> f64 {
        self.spending.values().sum()
    }

    pub async fn goals(&self) -> Vec<FinancialGoal> {
        self.goals.read().await.clone()
    }
}

fn account(name: &str, kind: AccountKind, balance: f64) -> Account {
    Account {
        name: name.to_string(),
        kind,
        balance,
    }
}

/// `50000.0` → `"$50,000.00"`
pub fn format_currency(amount: f64) -> String {
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{}${}.{:02}", sign, grouped, cents % 100)
}

fn into_map(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    }
}

//
// ================= Tools =================
//

pub struct FinancialSummaryTool {
    snapshot: Arc<FinanceSnapshot>,
}

#[async_trait::async_trait]
impl Tool for FinancialSummaryTool {
    fn name(&self) -> &str {
        "getFinancialSummary"
    }

    fn description(&self) -> &str {
        "Get a high-level summary of the user's finances: net worth, assets, liabilities, income and spending"
    }

    fn arg_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: &JsonMap) -> Result<JsonMap> {
        let s = &self.snapshot;
        let expenses = s.monthly_expenses();
        let savings_rate = if s.monthly_income > 0.0 {
            (s.monthly_income - expenses) / s.monthly_income * 100.0
        } else {
            0.0
        };

        Ok(into_map(json!({
            "summary": {
                "Net Worth": format_currency(s.net_worth()),
                "Total Assets": format_currency(s.total_assets()),
                "Total Liabilities": format_currency(s.total_liabilities()),
                "Monthly Income": format_currency(s.monthly_income),
                "Monthly Expenses": format_currency(expenses),
                "Savings Rate": format!("{:.1}%", savings_rate),
            }
        })))
    }
}

pub struct AccountBalancesTool {
    snapshot: Arc<FinanceSnapshot>,
}

#[async_trait::async_trait]
impl Tool for AccountBalancesTool {
    fn name(&self) -> &str {
        "getAccountBalances"
    }

    fn description(&self) -> &str {
        "List account balances, optionally filtered by account type"
    }

    fn arg_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "accountType": {
                    "type": "string",
                    "enum": ["checking", "savings", "investment", "credit", "loan"]
                }
            }
        })
    }

    async fn execute(&self, args: &JsonMap) -> Result<JsonMap> {
        let filter = match args.get("accountType").and_then(Value::as_str) {
            Some(raw) => Some(AccountKind::parse(raw).ok_or_else(|| {
                OrchestrationError::InvalidToolInput(format!("Unknown account type '{}'", raw))
            })?),
            None => None,
        };

        let accounts: Vec<Value> = self
            .snapshot
            .accounts
            .iter()
            .filter(|a| filter.map_or(true, |kind| a.kind == kind))
            .map(|a| {
                json!({
                    "name": a.name,
                    "type": a.kind,
                    "balance": format_currency(a.balance),
                })
            })
            .collect();

        Ok(into_map(json!({ "accounts": accounts, "count": accounts.len() })))
    }
}

pub struct SpendingByCategoryTool {
    snapshot: Arc<FinanceSnapshot>,
}

#[async_trait::async_trait]
impl Tool for SpendingByCategoryTool {
    fn name(&self) -> &str {
        "getSpendingByCategory"
    }

    fn description(&self) -> &str {
        "Break down last month's spending by budget category"
    }

    fn arg_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "category": { "type": "string", "description": "Only report this category" }
            }
        })
    }

    async fn execute(&self, args: &JsonMap) -> Result<JsonMap> {
        let spending = &self.snapshot.spending;

        if let Some(wanted) = args.get("category").and_then(Value::as_str) {
            let (name, amount) = spending
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(wanted.trim()))
                .ok_or_else(|| {
                    OrchestrationError::InvalidToolInput(format!("Unknown category '{}'", wanted))
                })?;
            let mut categories = JsonMap::new();
            categories.insert(name.clone(), json!(format_currency(*amount)));
            return Ok(into_map(json!({
                "categories": categories,
                "total": format_currency(*amount),
            })));
        }

        let categories: JsonMap = spending
            .iter()
            .map(|(name, amount)| (name.clone(), json!(format_currency(*amount))))
            .collect();

        Ok(into_map(json!({
            "categories": categories,
            "total": format_currency(self.snapshot.monthly_expenses()),
        })))
    }
}

/// Compound growth projection with monthly contributions
pub struct SavingsSimulationTool;

#[async_trait::async_trait]
impl Tool for SavingsSimulationTool {
    fn name(&self) -> &str {
        "simulateSavingsGrowth"
    }

    fn description(&self) -> &str {
        "Project savings growth with monthly contributions and an annual return rate"
    }

    fn arg_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "initialAmount": { "type": "number" },
                "monthlyContribution": { "type": "number" },
                "annualRatePercent": { "type": "number" },
                "years": { "type": "number" }
            },
            "required": ["years"]
        })
    }

    async fn execute(&self, args: &JsonMap) -> Result<JsonMap> {
        let initial = optional_f64(args, "initialAmount")?.unwrap_or(0.0);
        let monthly = optional_f64(args, "monthlyContribution")?.unwrap_or(0.0);
        let rate = optional_f64(args, "annualRatePercent")?.unwrap_or(5.0);
        let years = require_f64(args, "years")?;

        if !(1.0..=MAX_SIMULATION_YEARS).contains(&years) {
            return Err(OrchestrationError::InvalidToolInput(format!(
                "'years' must be between 1 and {}",
                MAX_SIMULATION_YEARS
            )));
        }
        if initial < 0.0 || monthly < 0.0 {
            return Err(OrchestrationError::InvalidToolInput(
                "Amounts must not be negative".to_string(),
            ));
        }

        let monthly_rate = rate / 100.0 / 12.0;
        let months = (years * 12.0).round() as u32;
        let mut balance = initial;
        let mut contributed = initial;
        let mut yearly = Vec::new();

        for month in 1..=months {
            balance = balance * (1.0 + monthly_rate) + monthly;
            contributed += monthly;
            if month % 12 == 0 || month == months {
                yearly.push(json!({
                    "year": (month as f64 / 12.0 * 10.0).round() / 10.0,
                    "balance": format_currency(balance),
                }));
            }
        }

        Ok(into_map(json!({
            "finalBalance": format_currency(balance),
            "totalContributed": format_currency(contributed),
            "totalGrowth": format_currency(balance - contributed),
            "projection": yearly,
        })))
    }
}

pub struct CreateGoalTool {
    snapshot: Arc<FinanceSnapshot>,
}

#[async_trait::async_trait]
impl Tool for CreateGoalTool {
    fn name(&self) -> &str {
        "createFinancialGoal"
    }

    fn description(&self) -> &str {
        "Create a savings goal with a target amount and optional target date (YYYY-MM-DD)"
    }

    fn arg_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "targetAmount": { "type": "number" },
                "currentAmount": { "type": "number" },
                "targetDate": { "type": "string", "format": "date" }
            },
            "required": ["name", "targetAmount"]
        })
    }

    async fn execute(&self, args: &JsonMap) -> Result<JsonMap> {
        let name = require_str(args, "name")?.trim().to_string();
        let target_amount = require_f64(args, "targetAmount")?;
        let current_amount = optional_f64(args, "currentAmount")?.unwrap_or(0.0);

        if target_amount <= 0.0 {
            return Err(OrchestrationError::InvalidToolInput(
                "'targetAmount' must be positive".to_string(),
            ));
        }

        let target_date = match args.get("targetDate").and_then(Value::as_str) {
            Some(raw) => {
                let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
                    OrchestrationError::InvalidToolInput(format!(
                        "'targetDate' must be YYYY-MM-DD, got {:?}",
                        raw
                    ))
                })?;
                if date <= Utc::now().date_naive() {
                    return Err(OrchestrationError::InvalidToolInput(
                        "'targetDate' must be in the future".to_string(),
                    ));
                }
                Some(date)
            }
            None => None,
        };

        let goal = FinancialGoal {
            id: Uuid::new_v4(),
            name,
            target_amount,
            current_amount,
            target_date,
            created_at: Utc::now(),
        };

        info!(goal_id = %goal.id, name = %goal.name, "Financial goal created");

        let response = json!({
            "goal": {
                "id": goal.id,
                "name": goal.name,
                "targetAmount": format_currency(goal.target_amount),
                "currentAmount": format_currency(goal.current_amount),
                "targetDate": goal.target_date.map(|d| d.to_string()),
            },
            "message": format!("Goal '{}' created", goal.name),
        });

        self.snapshot.goals.write().await.push(goal);

        Ok(into_map(response))
    }
}

/// Register every built-in tool over a shared snapshot.
pub fn registry_for(snapshot: Arc<FinanceSnapshot>) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(FinancialSummaryTool {
        snapshot: snapshot.clone(),
    }))?;
    registry.register(Arc::new(AccountBalancesTool {
        snapshot: snapshot.clone(),
    }))?;
    registry.register(Arc::new(SpendingByCategoryTool {
        snapshot: snapshot.clone(),
    }))?;
    registry.register(Arc::new(SavingsSimulationTool))?;
    registry.register(Arc::new(CreateGoalTool { snapshot }))?;

    Ok(registry)
}

/// Create a default registry over the sample household.
pub fn create_default_registry() -> Result<ToolRegistry> {
    registry_for(Arc::new(FinanceSnapshot::sample()))
}
