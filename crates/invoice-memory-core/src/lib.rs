#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    FieldMapping,
    Calculation,
    Behavior,
}

impl PatternType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FieldMapping => "field_mapping",
            Self::Calculation => "calculation",
            Self::Behavior => "behavior",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "field_mapping" => Some(Self::FieldMapping),
            "calculation" => Some(Self::Calculation),
            "behavior" => Some(Self::Behavior),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    VendorPattern,
    CorrectionPattern,
    ResolutionPattern,
}

impl MemoryKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VendorPattern => "vendor_pattern",
            Self::CorrectionPattern => "correction_pattern",
            Self::ResolutionPattern => "resolution_pattern",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "vendor_pattern" => Some(Self::VendorPattern),
            "correction_pattern" => Some(Self::CorrectionPattern),
            "resolution_pattern" => Some(Self::ResolutionPattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Recall,
    Apply,
    Decide,
    Learn,
}

impl PipelineStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recall => "recall",
            Self::Apply => "apply",
            Self::Decide => "decide",
            Self::Learn => "learn",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recall" => Some(Self::Recall),
            "apply" => Some(Self::Apply),
            "decide" => Some(Self::Decide),
            "learn" => Some(Self::Learn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionAction {
    AutoAccept,
    AutoCorrect,
    Escalate,
}

impl DecisionAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoAccept => "auto-accept",
            Self::AutoCorrect => "auto-correct",
            Self::Escalate => "escalate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto-accept" => Some(Self::AutoAccept),
            "auto-correct" => Some(Self::AutoCorrect),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FinalDecision {
    Approved,
    Rejected,
}

impl FinalDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Identifier for one processing (or learning) run; tags every audit entry
/// the run emits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub qty: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub qty_delivered: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceFields {
    pub invoice_number: String,
    pub invoice_date: String,
    #[serde(default)]
    pub service_date: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub po_number: Option<String>,
    pub net_total: f64,
    pub tax_rate: f64,
    pub tax_total: f64,
    pub gross_total: f64,
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub discount_terms: Option<String>,
}

/// An extracted invoice as handed over by the upstream extraction step.
///
/// The pipeline never mutates the caller's copy; Apply works on a deep
/// clone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub invoice_id: String,
    pub vendor: String,
    pub fields: InvoiceFields,
    pub confidence: f32,
    pub raw_text: String,
}

impl Invoice {
    /// Validates the caller-supplied parts of an invoice before processing.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when the invoice id or vendor
    /// is empty or the extraction confidence is out of range.
    pub fn validate(&self) -> Result<(), PipelineError> {
        ensure_non_empty("invoiceId", &self.invoice_id)?;
        ensure_non_empty("vendor", &self.vendor)?;
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(PipelineError::Validation(
                "confidence MUST be in [0.0, 1.0]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOrder {
    pub po_number: String,
    pub vendor: String,
    pub date: String,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VendorMemory {
    #[serde(default)]
    pub id: Option<i64>,
    pub vendor_name: String,
    pub pattern_type: PatternType,
    pub pattern_key: String,
    pub pattern_value: String,
    pub confidence: f32,
    pub usage_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionMemory {
    #[serde(default)]
    pub id: Option<i64>,
    pub correction_type: String,
    pub condition: String,
    pub action: String,
    pub confidence: f32,
    pub usage_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionMemory {
    #[serde(default)]
    pub id: Option<i64>,
    pub issue_type: String,
    pub resolution: String,
    pub human_approved: bool,
    pub confidence: f32,
    pub usage_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldCorrection {
    pub field: String,
    #[serde(default)]
    pub from: Value,
    #[serde(default)]
    pub to: Value,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HumanCorrection {
    pub invoice_id: String,
    pub vendor: String,
    pub corrections: Vec<FieldCorrection>,
    pub final_decision: FinalDecision,
}

impl HumanCorrection {
    /// Validates a human correction before learning from it.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when the invoice id or vendor
    /// is empty.
    pub fn validate(&self) -> Result<(), PipelineError> {
        ensure_non_empty("invoiceId", &self.invoice_id)?;
        ensure_non_empty("vendor", &self.vendor)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditTrailEntry {
    pub stage: PipelineStage,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub run_id: RunId,
    pub normalized_invoice: Invoice,
    pub proposed_corrections: Vec<String>,
    pub requires_human_review: bool,
    pub reasoning: String,
    pub confidence_score: f32,
    pub audit_trail: Vec<AuditTrailEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalledMemories {
    pub vendor_memories: Vec<VendorMemory>,
    pub correction_memories: Vec<CorrectionMemory>,
    pub resolution_memories: Vec<ResolutionMemory>,
}

impl RecalledMemories {
    #[must_use]
    pub fn total(&self) -> usize {
        self.vendor_memories.len() + self.correction_memories.len() + self.resolution_memories.len()
    }
}

/// Tunable constants of the pipeline. `v1()` reproduces the learned-pattern
/// arithmetic of the reference deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRuleset {
    pub usability_floor: f32,
    pub recall_limit: usize,
    pub auto_accept_min_confidence: f32,
    pub auto_correct_min_confidence: f32,
    pub tax_recalc_tolerance: f64,
    pub tax_discrepancy_max_percent: f64,
    pub reinforcement_step: f32,
    pub reinforcement_cap: f32,
    pub tax_included_default_confidence: f32,
    pub currency_recovery_confidence: f32,
    pub po_match_confidence: f32,
    pub skonto_confidence: f32,
    pub seed_field_mapping_confidence: f32,
    pub seed_tax_included_confidence: f32,
    pub seed_currency_confidence: f32,
    pub seed_po_behavior_confidence: f32,
    pub seed_skonto_confidence: f32,
    pub resolution_confidence: f32,
}

impl PipelineRuleset {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            usability_floor: 0.3,
            recall_limit: 10,
            auto_accept_min_confidence: 0.8,
            auto_correct_min_confidence: 0.5,
            tax_recalc_tolerance: 1.0,
            tax_discrepancy_max_percent: 5.0,
            reinforcement_step: 0.10,
            reinforcement_cap: 0.95,
            tax_included_default_confidence: 0.7,
            currency_recovery_confidence: 0.8,
            po_match_confidence: 0.75,
            skonto_confidence: 0.8,
            seed_field_mapping_confidence: 0.7,
            seed_tax_included_confidence: 0.75,
            seed_currency_confidence: 0.8,
            seed_po_behavior_confidence: 0.65,
            seed_skonto_confidence: 0.8,
            resolution_confidence: 0.7,
        }
    }

    /// Validates ruleset numeric bounds.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] when one or more fields are
    /// outside allowed bounds.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, value) in [
            ("usability_floor", self.usability_floor),
            ("auto_accept_min_confidence", self.auto_accept_min_confidence),
            (
                "auto_correct_min_confidence",
                self.auto_correct_min_confidence,
            ),
            ("reinforcement_step", self.reinforcement_step),
            ("reinforcement_cap", self.reinforcement_cap),
            (
                "tax_included_default_confidence",
                self.tax_included_default_confidence,
            ),
            (
                "currency_recovery_confidence",
                self.currency_recovery_confidence,
            ),
            ("po_match_confidence", self.po_match_confidence),
            ("skonto_confidence", self.skonto_confidence),
            (
                "seed_field_mapping_confidence",
                self.seed_field_mapping_confidence,
            ),
            (
                "seed_tax_included_confidence",
                self.seed_tax_included_confidence,
            ),
            ("seed_currency_confidence", self.seed_currency_confidence),
            (
                "seed_po_behavior_confidence",
                self.seed_po_behavior_confidence,
            ),
            ("seed_skonto_confidence", self.seed_skonto_confidence),
            ("resolution_confidence", self.resolution_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.recall_limit == 0 {
            return Err(PipelineError::Configuration(
                "recall_limit MUST be >= 1".to_string(),
            ));
        }

        if self.auto_correct_min_confidence > self.auto_accept_min_confidence {
            return Err(PipelineError::Configuration(
                "auto_correct_min_confidence cannot exceed auto_accept_min_confidence".to_string(),
            ));
        }

        if self.tax_recalc_tolerance < 0.0 || self.tax_discrepancy_max_percent < 0.0 {
            return Err(PipelineError::Configuration(
                "tax tolerances MUST be non-negative".to_string(),
            ));
        }

        Ok(())
    }
}

/// Durable memory collaborator. Retrieval methods MUST exclude memories at
/// or below the usability floor and order by confidence descending, ties
/// broken by most recent `last_used` (never-used rows last).
pub trait MemoryStore {
    #[allow(clippy::missing_errors_doc)]
    fn list_vendor_memories(&self, vendor_name: &str) -> Result<Vec<VendorMemory>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_correction_memories(&self) -> Result<Vec<CorrectionMemory>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_resolution_memories(&self) -> Result<Vec<ResolutionMemory>>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_vendor_memory(&mut self, memory: &VendorMemory) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_correction_memory(&mut self, memory: &CorrectionMemory) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_resolution_memory(&mut self, memory: &ResolutionMemory) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn reinforce(
        &mut self,
        kind: MemoryKind,
        id: i64,
        new_confidence: f32,
        bump_usage: bool,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn find_vendor_memory(
        &self,
        vendor_name: &str,
        pattern_key: &str,
    ) -> Result<Option<VendorMemory>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_correction_memory(&self, correction_type: &str) -> Result<Option<CorrectionMemory>>;

    #[allow(clippy::missing_errors_doc)]
    fn is_duplicate_invoice(&self, vendor: &str, invoice_number: &str) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn mark_invoice_processed(
        &mut self,
        invoice_id: &str,
        vendor: &str,
        invoice_number: &str,
        invoice_date: &str,
    ) -> Result<()>;
}

/// Best-effort audit collaborator; a failing sink never aborts the stage it
/// reports on.
pub trait AuditSink {
    #[allow(clippy::missing_errors_doc)]
    fn append(
        &mut self,
        run_id: RunId,
        subject_id: &str,
        stage: PipelineStage,
        details: &str,
    ) -> Result<()>;
}

/// Fetches the top candidate memories for an invoice's vendor, capped at the
/// ruleset's recall limit per kind. Pure read; empty results are normal.
///
/// # Errors
/// Propagates store failures.
pub fn recall_memories<S: MemoryStore + ?Sized>(
    store: &S,
    vendor: &str,
    ruleset: &PipelineRuleset,
) -> Result<RecalledMemories> {
    let mut vendor_memories = store.list_vendor_memories(vendor)?;
    let mut correction_memories = store.list_correction_memories()?;
    let mut resolution_memories = store.list_resolution_memories()?;

    vendor_memories.truncate(ruleset.recall_limit);
    correction_memories.truncate(ruleset.recall_limit);
    resolution_memories.truncate(ruleset.recall_limit);

    Ok(RecalledMemories {
        vendor_memories,
        correction_memories,
        resolution_memories,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub normalized_invoice: Invoice,
    pub proposed_corrections: Vec<String>,
    pub confidence_score: f32,
    pub reasoning: String,
}

struct ApplyContext<'a> {
    memories: &'a RecalledMemories,
    purchase_orders: &'a [PurchaseOrder],
    ruleset: &'a PipelineRuleset,
}

struct Detection {
    correction: String,
    reasoning: String,
    contribution: f32,
}

type Detector = fn(&mut Invoice, &ApplyContext<'_>) -> Option<Detection>;

// The battery is order-independent; entries run in declaration order.
const DETECTORS: &[Detector] = &[
    detect_service_date,
    detect_tax_included,
    detect_currency,
    detect_freight_sku,
    detect_po_match,
    detect_discount_terms,
];

static SERVICE_DATE_RE: Lazy<Regex> =
    Lazy::new(|| compile_pattern(r"Leistungsdatum:\s*(\d{2})\.(\d{2})\.(\d{4})"));
static TAX_INCLUDED_RE: Lazy<Regex> = Lazy::new(|| {
    compile_pattern(r"(?i)MwSt\.\s*inkl\.|incl\.\s*VAT|VAT already included|Prices incl\. VAT")
});
static FREIGHT_RE: Lazy<Regex> = Lazy::new(|| compile_pattern(r"(?i)Seefracht|Shipping"));
static SKONTO_RE: Lazy<Regex> = Lazy::new(|| compile_pattern(r"(?i)(\d+)%\s*Skonto.*?(\d+)\s*days"));

fn compile_pattern(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid built-in pattern {pattern}: {err}"))
}

/// Runs the detector battery over a deep copy of the invoice and aggregates
/// a confidence score as a running average seeded with the extraction
/// confidence.
#[must_use]
pub fn apply_memories(
    invoice: &Invoice,
    memories: &RecalledMemories,
    purchase_orders: &[PurchaseOrder],
    ruleset: &PipelineRuleset,
) -> ApplyOutcome {
    let mut normalized = invoice.clone();
    let context = ApplyContext {
        memories,
        purchase_orders,
        ruleset,
    };

    let mut proposed_corrections = Vec::new();
    let mut reasoning = String::new();
    let mut confidence_sum = invoice.confidence;
    let mut confidence_count = 1.0_f32;

    for detector in DETECTORS {
        if let Some(found) = detector(&mut normalized, &context) {
            proposed_corrections.push(found.correction);
            reasoning.push_str(&found.reasoning);
            reasoning.push(' ');
            confidence_sum += found.contribution;
            confidence_count += 1.0;
        }
    }

    let reasoning = reasoning.trim().to_string();
    ApplyOutcome {
        normalized_invoice: normalized,
        proposed_corrections,
        confidence_score: confidence_sum / confidence_count,
        reasoning: if reasoning.is_empty() {
            "No memory-based corrections applied.".to_string()
        } else {
            reasoning
        },
    }
}

fn detect_service_date(invoice: &mut Invoice, context: &ApplyContext<'_>) -> Option<Detection> {
    let memory = context.memories.vendor_memories.iter().find(|memory| {
        memory.pattern_key == "Leistungsdatum" && memory.pattern_type == PatternType::FieldMapping
    })?;

    if !is_blank(invoice.fields.service_date.as_deref()) {
        return None;
    }

    let (day, month, year) = {
        let caps = SERVICE_DATE_RE.captures(&invoice.raw_text)?;
        (
            caps[1].to_string(),
            caps[2].to_string(),
            caps[3].to_string(),
        )
    };

    invoice.fields.service_date = Some(format!("{year}-{month}-{day}"));
    Some(Detection {
        correction: format!(
            "Applied serviceDate from Leistungsdatum pattern (confidence: {:.2})",
            memory.confidence
        ),
        reasoning: format!(
            "Vendor {} uses \"Leistungsdatum\" for service dates.",
            invoice.vendor
        ),
        contribution: memory.confidence,
    })
}

fn detect_tax_included(invoice: &mut Invoice, context: &ApplyContext<'_>) -> Option<Detection> {
    if !TAX_INCLUDED_RE.is_match(&invoice.raw_text) {
        return None;
    }

    let gross = invoice.fields.gross_total;
    let divisor = 1.0 + invoice.fields.tax_rate;
    if divisor.abs() < f64::EPSILON {
        return None;
    }

    let recalc_net = gross / divisor;
    let recalc_tax = gross - recalc_net;
    if (recalc_tax - invoice.fields.tax_total).abs() <= context.ruleset.tax_recalc_tolerance {
        return None;
    }

    invoice.fields.net_total = round_cents(recalc_net);
    invoice.fields.tax_total = round_cents(recalc_tax);

    let contribution = context
        .memories
        .correction_memories
        .iter()
        .find(|memory| memory.correction_type == "tax_included")
        .map_or(context.ruleset.tax_included_default_confidence, |memory| {
            memory.confidence
        });

    Some(Detection {
        correction: format!(
            "Recalculated tax: VAT included in total (net: {}, tax: {})",
            invoice.fields.net_total, invoice.fields.tax_total
        ),
        reasoning: "Detected \"VAT included\" pattern - recalculated net and tax from gross total."
            .to_string(),
        contribution,
    })
}

fn detect_currency(invoice: &mut Invoice, context: &ApplyContext<'_>) -> Option<Detection> {
    if !is_blank(invoice.fields.currency.as_deref()) || !invoice.raw_text.contains("EUR") {
        return None;
    }

    invoice.fields.currency = Some("EUR".to_string());
    Some(Detection {
        correction: "Recovered currency EUR from rawText".to_string(),
        reasoning: "Extracted missing currency from invoice text.".to_string(),
        contribution: context.ruleset.currency_recovery_confidence,
    })
}

fn detect_freight_sku(invoice: &mut Invoice, context: &ApplyContext<'_>) -> Option<Detection> {
    let mut mapped = false;
    for item in &mut invoice.fields.line_items {
        if is_blank(item.sku.as_deref())
            && item
                .description
                .as_deref()
                .is_some_and(|description| FREIGHT_RE.is_match(description))
        {
            item.sku = Some("FREIGHT".to_string());
            mapped = true;
        }
    }

    if !mapped {
        return None;
    }

    // The SKU fill-in stands on its own; only a learned vendor memory makes
    // it a reportable, scored correction.
    let memory = context.memories.vendor_memories.iter().find(|memory| {
        memory.pattern_key == "Seefracht" && memory.pattern_type == PatternType::FieldMapping
    })?;

    Some(Detection {
        correction: format!(
            "Mapped \"Seefracht/Shipping\" to SKU FREIGHT (confidence: {:.2})",
            memory.confidence
        ),
        reasoning: "Applied learned freight description mapping.".to_string(),
        contribution: memory.confidence,
    })
}

fn detect_po_match(invoice: &mut Invoice, context: &ApplyContext<'_>) -> Option<Detection> {
    if !is_blank(invoice.fields.po_number.as_deref()) || context.purchase_orders.is_empty() {
        return None;
    }

    let matching: Vec<&PurchaseOrder> = context
        .purchase_orders
        .iter()
        .filter(|po| {
            po.vendor == invoice.vendor
                && po.line_items.iter().any(|po_item| {
                    invoice
                        .fields
                        .line_items
                        .iter()
                        .any(|item| item.sku == po_item.sku && qty_matches(item.qty, po_item.qty))
                })
        })
        .collect();

    let [po] = matching.as_slice() else {
        return None;
    };

    invoice.fields.po_number = Some(po.po_number.clone());
    Some(Detection {
        correction: format!(
            "Matched to PO {} (single matching PO with same items)",
            po.po_number
        ),
        reasoning: "Auto-matched to PO based on vendor and line items.".to_string(),
        contribution: context.ruleset.po_match_confidence,
    })
}

fn detect_discount_terms(invoice: &mut Invoice, context: &ApplyContext<'_>) -> Option<Detection> {
    if !is_blank(invoice.fields.discount_terms.as_deref()) {
        return None;
    }

    let (percent, days) = {
        let caps = SKONTO_RE.captures(&invoice.raw_text)?;
        (caps[1].to_string(), caps[2].to_string())
    };

    let terms = format!("{percent}% Skonto within {days} days");
    invoice.fields.discount_terms = Some(terms.clone());
    Some(Detection {
        correction: format!("Extracted discount terms: {terms}"),
        reasoning: "Detected and stored Skonto payment terms.".to_string(),
        contribution: context.ruleset.skonto_confidence,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutcome {
    pub requires_human_review: bool,
    pub action: DecisionAction,
    pub reasoning: String,
    pub duplicate: bool,
}

/// Classifies a normalized invoice. Evaluation order: duplicate check,
/// integrity issues, then the confidence thresholds; first applicable wins.
///
/// # Errors
/// Propagates store failures from the duplicate check.
pub fn make_decision<S: MemoryStore + ?Sized>(
    store: &S,
    normalized: &Invoice,
    corrections: &[String],
    confidence_score: f32,
    ruleset: &PipelineRuleset,
) -> Result<DecisionOutcome> {
    if store.is_duplicate_invoice(&normalized.vendor, &normalized.fields.invoice_number)? {
        return Ok(DecisionOutcome {
            requires_human_review: true,
            action: DecisionAction::Escalate,
            reasoning: format!(
                "DUPLICATE DETECTED: Invoice {} from {} already processed.",
                normalized.fields.invoice_number, normalized.vendor
            ),
            duplicate: true,
        });
    }

    let issues = integrity_issues(&normalized.fields, ruleset);
    if !issues.is_empty() {
        return Ok(DecisionOutcome {
            requires_human_review: true,
            action: DecisionAction::Escalate,
            reasoning: format!(
                "Issues detected: {}. Requires human review.",
                issues.join(", ")
            ),
            duplicate: false,
        });
    }

    if confidence_score >= ruleset.auto_accept_min_confidence && corrections.is_empty() {
        return Ok(DecisionOutcome {
            requires_human_review: false,
            action: DecisionAction::AutoAccept,
            reasoning: format!(
                "High confidence ({confidence_score:.2}), no corrections needed. Auto-accepted."
            ),
            duplicate: false,
        });
    }

    if confidence_score >= ruleset.auto_correct_min_confidence && !corrections.is_empty() {
        return Ok(DecisionOutcome {
            requires_human_review: true,
            action: DecisionAction::AutoCorrect,
            reasoning: format!(
                "Applied {} correction(s) with confidence {confidence_score:.2}. Review recommended for audit.",
                corrections.len()
            ),
            duplicate: false,
        });
    }

    Ok(DecisionOutcome {
        requires_human_review: true,
        action: DecisionAction::Escalate,
        reasoning: format!(
            "Low confidence ({confidence_score:.2}). Escalating for human review."
        ),
        duplicate: false,
    })
}

fn integrity_issues(fields: &InvoiceFields, ruleset: &PipelineRuleset) -> Vec<String> {
    let mut issues = Vec::new();

    if fields.invoice_number.trim().is_empty() {
        issues.push("missing invoiceNumber".to_string());
    }
    if fields.gross_total.abs() < f64::EPSILON {
        issues.push("missing grossTotal".to_string());
    }
    if is_blank(fields.currency.as_deref()) {
        issues.push("missing currency".to_string());
    }
    if fields.gross_total < 0.0 {
        issues.push("negative grossTotal".to_string());
    }

    let expected_tax = fields.net_total * fields.tax_rate;
    if expected_tax.abs() < ZERO_TAX_EPSILON {
        // Zero expected tax leaves the percentage undefined; a present tax
        // total is still a discrepancy.
        if fields.tax_total.abs() > ZERO_TAX_EPSILON {
            issues.push("tax discrepancy: expected zero tax but tax total is present".to_string());
        }
    } else {
        let discrepancy_percent = ((expected_tax - fields.tax_total).abs() / expected_tax) * 100.0;
        if discrepancy_percent > ruleset.tax_discrepancy_max_percent {
            issues.push(format!(
                "tax calculation discrepancy {discrepancy_percent:.1}%"
            ));
        }
    }

    issues
}

const ZERO_TAX_EPSILON: f64 = 1e-9;

enum LearnOutcome {
    Reinforced(f32),
    Created,
}

/// Updates the memory store from an explicit human correction and returns
/// one human-readable description per memory update.
///
/// # Errors
/// Returns a validation error for an empty invoice id or vendor; store
/// failures propagate.
pub fn learn_from_correction<S: MemoryStore + ?Sized>(
    store: &mut S,
    correction: &HumanCorrection,
    ruleset: &PipelineRuleset,
) -> Result<Vec<String>> {
    correction.validate()?;

    let mut updates = Vec::new();
    let now = now_utc();

    for fix in &correction.corrections {
        if fix.field == "serviceDate" && fix.reason.contains("Leistungsdatum") {
            let outcome = reinforce_or_create_vendor(
                store,
                &correction.vendor,
                PatternType::FieldMapping,
                "Leistungsdatum",
                "serviceDate",
                ruleset.seed_field_mapping_confidence,
                ruleset,
                now,
            )?;
            updates.push(match outcome {
                LearnOutcome::Reinforced(confidence) => format!(
                    "Reinforced: {} - Leistungsdatum pattern (confidence: {confidence:.2})",
                    correction.vendor
                ),
                LearnOutcome::Created => format!(
                    "Learned: {} - Leistungsdatum maps to serviceDate",
                    correction.vendor
                ),
            });
        }

        if (fix.field == "taxTotal" || fix.field == "grossTotal")
            && fix.reason.contains("VAT included")
        {
            let outcome = if let Some(existing) = store.find_correction_memory("tax_included")? {
                let id = stored_id(existing.id, MemoryKind::CorrectionPattern)?;
                let new_confidence = reinforced_confidence(existing.confidence, ruleset);
                store.reinforce(MemoryKind::CorrectionPattern, id, new_confidence, true)?;
                LearnOutcome::Reinforced(new_confidence)
            } else {
                store.insert_correction_memory(&CorrectionMemory {
                    id: None,
                    correction_type: "tax_included".to_string(),
                    condition: "MwSt. inkl. OR incl. VAT in rawText".to_string(),
                    action: "recalculate tax from gross total".to_string(),
                    confidence: ruleset.seed_tax_included_confidence,
                    usage_count: 1,
                    last_used: Some(now),
                    created_at: now,
                })?;
                LearnOutcome::Created
            };
            updates.push(match outcome {
                LearnOutcome::Reinforced(confidence) => format!(
                    "Reinforced: VAT included correction pattern (confidence: {confidence:.2})"
                ),
                LearnOutcome::Created => "Learned: VAT included correction pattern".to_string(),
            });
        }

        if fix.field == "currency" && fix.reason.contains("rawText") {
            let outcome = reinforce_or_create_vendor(
                store,
                &correction.vendor,
                PatternType::FieldMapping,
                "currency_extraction",
                "EUR",
                ruleset.seed_currency_confidence,
                ruleset,
                now,
            )?;
            updates.push(match outcome {
                LearnOutcome::Reinforced(confidence) => format!(
                    "Reinforced: {} - currency extraction pattern (confidence: {confidence:.2})",
                    correction.vendor
                ),
                LearnOutcome::Created => format!(
                    "Learned: {} - currency extraction from rawText",
                    correction.vendor
                ),
            });
        }

        if fix.field.contains("sku") && fix.reason.contains("Seefracht") {
            let outcome = reinforce_or_create_vendor(
                store,
                &correction.vendor,
                PatternType::FieldMapping,
                "Seefracht",
                "FREIGHT",
                ruleset.seed_field_mapping_confidence,
                ruleset,
                now,
            )?;
            updates.push(match outcome {
                LearnOutcome::Reinforced(confidence) => format!(
                    "Reinforced: {} - Seefracht pattern (confidence: {confidence:.2})",
                    correction.vendor
                ),
                LearnOutcome::Created => format!(
                    "Learned: {} - Seefracht/Shipping maps to FREIGHT SKU",
                    correction.vendor
                ),
            });
        }

        if fix.field == "poNumber" && value_is_present(&fix.to) {
            let outcome = reinforce_or_create_vendor(
                store,
                &correction.vendor,
                PatternType::Behavior,
                "po_matching",
                "infer from items and date",
                ruleset.seed_po_behavior_confidence,
                ruleset,
                now,
            )?;
            updates.push(match outcome {
                LearnOutcome::Reinforced(confidence) => format!(
                    "Reinforced: {} - PO matching pattern (confidence: {confidence:.2})",
                    correction.vendor
                ),
                LearnOutcome::Created => {
                    format!("Learned: {} - PO matching pattern", correction.vendor)
                }
            });
        }

        if fix.field == "discountTerms" {
            let outcome = reinforce_or_create_vendor(
                store,
                &correction.vendor,
                PatternType::FieldMapping,
                "skonto_terms",
                &value_text(&fix.to),
                ruleset.seed_skonto_confidence,
                ruleset,
                now,
            )?;
            updates.push(match outcome {
                LearnOutcome::Reinforced(confidence) => format!(
                    "Reinforced: {} - Skonto terms pattern (confidence: {confidence:.2})",
                    correction.vendor
                ),
                LearnOutcome::Created => {
                    format!("Learned: {} - Skonto terms pattern", correction.vendor)
                }
            });
        }
    }

    store.insert_resolution_memory(&ResolutionMemory {
        id: None,
        issue_type: correction
            .corrections
            .iter()
            .map(|fix| fix.field.clone())
            .collect::<Vec<_>>()
            .join(", "),
        resolution: correction
            .corrections
            .iter()
            .map(|fix| fix.reason.clone())
            .collect::<Vec<_>>()
            .join("; "),
        human_approved: correction.final_decision == FinalDecision::Approved,
        confidence: ruleset.resolution_confidence,
        usage_count: 1,
        last_used: Some(now),
        created_at: now,
    })?;
    updates.push(format!(
        "Stored resolution: {}",
        correction.final_decision.as_str()
    ));

    Ok(updates)
}

/// Reinforcement rule: one step up, capped, never decreasing.
#[must_use]
pub fn reinforced_confidence(old: f32, ruleset: &PipelineRuleset) -> f32 {
    old.max((old + ruleset.reinforcement_step).min(ruleset.reinforcement_cap))
}

#[allow(clippy::too_many_arguments)]
fn reinforce_or_create_vendor<S: MemoryStore + ?Sized>(
    store: &mut S,
    vendor: &str,
    pattern_type: PatternType,
    pattern_key: &str,
    pattern_value: &str,
    seed_confidence: f32,
    ruleset: &PipelineRuleset,
    now: OffsetDateTime,
) -> Result<LearnOutcome> {
    if let Some(existing) = store.find_vendor_memory(vendor, pattern_key)? {
        let id = stored_id(existing.id, MemoryKind::VendorPattern)?;
        let new_confidence = reinforced_confidence(existing.confidence, ruleset);
        store.reinforce(MemoryKind::VendorPattern, id, new_confidence, true)?;
        return Ok(LearnOutcome::Reinforced(new_confidence));
    }

    store.insert_vendor_memory(&VendorMemory {
        id: None,
        vendor_name: vendor.to_string(),
        pattern_type,
        pattern_key: pattern_key.to_string(),
        pattern_value: pattern_value.to_string(),
        confidence: seed_confidence,
        usage_count: 1,
        last_used: Some(now),
        created_at: now,
    })?;
    Ok(LearnOutcome::Created)
}

fn stored_id(id: Option<i64>, kind: MemoryKind) -> Result<i64> {
    id.ok_or_else(|| anyhow!("stored {} memory is missing an id", kind.as_str()))
}

/// Sequences Recall → Apply → Decide for inbound invoices and routes human
/// corrections to Learn, recording an audit entry per stage transition.
pub struct InvoiceProcessor<S, A> {
    store: S,
    audit: A,
    ruleset: PipelineRuleset,
}

impl<S: MemoryStore, A: AuditSink> InvoiceProcessor<S, A> {
    #[must_use]
    pub fn new(store: S, audit: A) -> Self {
        Self {
            store,
            audit,
            ruleset: PipelineRuleset::v1(),
        }
    }

    /// Builds a processor with a custom ruleset.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] for an invalid ruleset.
    pub fn with_ruleset(
        store: S,
        audit: A,
        ruleset: PipelineRuleset,
    ) -> Result<Self, PipelineError> {
        ruleset.validate()?;
        Ok(Self {
            store,
            audit,
            ruleset,
        })
    }

    #[must_use]
    pub fn ruleset(&self) -> &PipelineRuleset {
        &self.ruleset
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs the full pipeline over one invoice. The invoice is marked
    /// processed unless the decision was a duplicate escalation; a store
    /// failure aborts the invocation before any such marking.
    ///
    /// # Errors
    /// Returns validation errors for malformed caller input and propagates
    /// store failures.
    pub fn process(
        &mut self,
        invoice: &Invoice,
        purchase_orders: &[PurchaseOrder],
    ) -> Result<ProcessingResult> {
        invoice.validate()?;

        let run_id = RunId::new();
        tracing::debug!(invoice_id = %invoice.invoice_id, run_id = %run_id, "processing invoice");
        let mut audit_trail = Vec::new();

        let memories = recall_memories(&self.store, &invoice.vendor, &self.ruleset)?;
        self.record_stage(
            run_id,
            &invoice.invoice_id,
            PipelineStage::Recall,
            format!(
                "Recalled {} vendor memories, {} correction patterns, {} resolutions",
                memories.vendor_memories.len(),
                memories.correction_memories.len(),
                memories.resolution_memories.len()
            ),
            &mut audit_trail,
        );

        let applied = apply_memories(invoice, &memories, purchase_orders, &self.ruleset);
        self.record_stage(
            run_id,
            &invoice.invoice_id,
            PipelineStage::Apply,
            format!(
                "Applied memories: {} corrections proposed. {}",
                applied.proposed_corrections.len(),
                applied.reasoning
            ),
            &mut audit_trail,
        );

        let decision = make_decision(
            &self.store,
            &applied.normalized_invoice,
            &applied.proposed_corrections,
            applied.confidence_score,
            &self.ruleset,
        )?;
        self.record_stage(
            run_id,
            &invoice.invoice_id,
            PipelineStage::Decide,
            format!("Decision: {}. {}", decision.action.as_str(), decision.reasoning),
            &mut audit_trail,
        );

        if !decision.duplicate {
            self.store.mark_invoice_processed(
                &invoice.invoice_id,
                &invoice.vendor,
                &invoice.fields.invoice_number,
                &invoice.fields.invoice_date,
            )?;
        }

        Ok(ProcessingResult {
            run_id,
            normalized_invoice: applied.normalized_invoice,
            proposed_corrections: applied.proposed_corrections,
            requires_human_review: decision.requires_human_review,
            reasoning: format!("{} {}", decision.reasoning, applied.reasoning),
            confidence_score: applied.confidence_score,
            audit_trail,
        })
    }

    /// Learns from a human correction and audits the resulting updates.
    ///
    /// # Errors
    /// Returns validation errors for malformed corrections and propagates
    /// store failures.
    pub fn apply_correction(&mut self, correction: &HumanCorrection) -> Result<Vec<String>> {
        let run_id = RunId::new();
        tracing::debug!(
            invoice_id = %correction.invoice_id,
            run_id = %run_id,
            "learning from human correction"
        );

        let updates = learn_from_correction(&mut self.store, correction, &self.ruleset)?;

        let mut audit_trail = Vec::new();
        self.record_stage(
            run_id,
            &correction.invoice_id,
            PipelineStage::Learn,
            format!("Learned from human correction: {}", updates.join("; ")),
            &mut audit_trail,
        );

        Ok(updates)
    }

    fn record_stage(
        &mut self,
        run_id: RunId,
        subject_id: &str,
        stage: PipelineStage,
        details: String,
        audit_trail: &mut Vec<AuditTrailEntry>,
    ) {
        if let Err(err) = self.audit.append(run_id, subject_id, stage, &details) {
            tracing::warn!(stage = stage.as_str(), error = %err, "audit sink append failed");
        }
        audit_trail.push(AuditTrailEntry {
            stage,
            timestamp: now_utc(),
            details,
        });
    }
}

fn is_blank(value: Option<&str>) -> bool {
    match value {
        Some(text) => text.trim().is_empty(),
        None => true,
    }
}

fn qty_matches(left: f64, right: f64) -> bool {
    (left - right).abs() < f64::EPSILON
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn value_is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => matches!(number.as_f64(), Some(n) if n.abs() > f64::EPSILON),
        Value::String(text) => !text.trim().is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when the provided value is
/// empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, PipelineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| PipelineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(PipelineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PipelineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            PipelineError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
