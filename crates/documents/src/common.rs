//! Building blocks shared by every document aggregate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    ActorId, Aggregate, CompanyId, DocumentId, DomainError, DomainResult, LotId, MovementId,
    Stamp,
};
use stockledger_events::Event;

/// The five document types that move stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Purchase,
    Dispatch,
    Donation,
    Adjustment,
    Transfer,
}

impl DocumentKind {
    /// Stream type recorded with every stored event.
    pub fn aggregate_type(self) -> &'static str {
        match self {
            DocumentKind::Purchase => "documents.purchase",
            DocumentKind::Dispatch => "documents.dispatch",
            DocumentKind::Donation => "documents.donation",
            DocumentKind::Adjustment => "documents.adjustment",
            DocumentKind::Transfer => "documents.transfer",
        }
    }
}

/// A command addressed to one document, on behalf of one actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCommand<A> {
    pub company_id: CompanyId,
    pub document_id: DocumentId,
    pub stamp: Stamp,
    pub action: A,
}

impl<A> DocumentCommand<A> {
    pub fn new(company_id: CompanyId, document_id: DocumentId, stamp: Stamp, action: A) -> Self {
        Self {
            company_id,
            document_id,
            stamp,
            action,
        }
    }
}

/// Names a document change for the event log.
pub trait DocumentChange: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;
}

/// A document event: who changed which document, when, and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEvent<C> {
    pub company_id: CompanyId,
    pub document_id: DocumentId,
    pub actor_id: ActorId,
    pub occurred_at: DateTime<Utc>,
    pub change: C,
}

impl<C> DocumentEvent<C> {
    pub fn new<A>(cmd: &DocumentCommand<A>, change: C) -> Self {
        Self {
            company_id: cmd.company_id,
            document_id: cmd.document_id,
            actor_id: cmd.stamp.actor_id,
            occurred_at: cmd.stamp.at,
            change,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.actor_id, self.occurred_at)
    }
}

impl<C: DocumentChange> Event for DocumentEvent<C> {
    fn event_type(&self) -> &'static str {
        self.change.event_type()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// A ledger entry generated by a document line. Weak link: ids only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementLink {
    pub line_no: u32,
    pub movement_id: MovementId,
    pub lot_id: Option<LotId>,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
}

/// Audit trail entry for a status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: String,
    pub stamp: Stamp,
}

/// Identity, tenancy, versioning and audit state every document carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentState {
    pub(crate) id: DocumentId,
    pub(crate) company_id: Option<CompanyId>,
    pub(crate) created: Option<Stamp>,
    pub(crate) version: u64,
    pub(crate) history: Vec<StatusChange>,
    pub(crate) movements: Vec<MovementLink>,
}

impl DocumentState {
    pub(crate) fn new(id: DocumentId) -> Self {
        Self {
            id,
            company_id: None,
            created: None,
            version: 0,
            history: Vec::new(),
            movements: Vec::new(),
        }
    }

    pub(crate) fn is_created(&self) -> bool {
        self.created.is_some()
    }

    pub(crate) fn ensure_absent<A>(&self, cmd: &DocumentCommand<A>, what: &str) -> DomainResult<()> {
        if self.is_created() {
            return Err(DomainError::conflict(format!("{what} {} already exists", cmd.document_id)));
        }
        if self.id != cmd.document_id {
            return Err(DomainError::invariant("document_id mismatch"));
        }
        Ok(())
    }

    /// The document exists, belongs to the command's company and is the one addressed.
    pub(crate) fn ensure_target<A>(&self, cmd: &DocumentCommand<A>, what: &str) -> DomainResult<()> {
        if !self.is_created() {
            return Err(DomainError::not_found(format!("{what} {}", cmd.document_id)));
        }
        if self.company_id != Some(cmd.company_id) {
            return Err(DomainError::invariant("company mismatch"));
        }
        if self.id != cmd.document_id {
            return Err(DomainError::invariant("document_id mismatch"));
        }
        Ok(())
    }

    pub(crate) fn record_created(&mut self, company_id: CompanyId, status: &str, stamp: Stamp) {
        self.company_id = Some(company_id);
        self.created = Some(stamp);
        self.record_status(status, stamp);
    }

    pub(crate) fn record_status(&mut self, status: &str, stamp: Stamp) {
        self.history.push(StatusChange {
            status: status.to_string(),
            stamp,
        });
    }

    pub(crate) fn bump(&mut self) {
        self.version += 1;
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn company_id(&self) -> Option<CompanyId> {
        self.company_id
    }

    pub fn created(&self) -> Option<Stamp> {
        self.created
    }

    pub fn history(&self) -> &[StatusChange] {
        &self.history
    }

    pub fn movements(&self) -> &[MovementLink] {
        &self.movements
    }

    pub fn movement_ids(&self) -> Vec<MovementId> {
        self.movements.iter().map(|l| l.movement_id).collect()
    }
}

/// A document aggregate that the workflow engine can load and drive.
pub trait Document: Aggregate<Id = DocumentId, Error = DomainError> + Clone {
    const KIND: DocumentKind;

    /// Empty, not-yet-created instance for rehydration.
    fn empty(id: DocumentId) -> Self;

    fn state(&self) -> &DocumentState;

    fn status_label(&self) -> &'static str;

    /// Command recording the ledger entries a fulfilling transition produced.
    fn link_command(
        company_id: CompanyId,
        document_id: DocumentId,
        stamp: Stamp,
        links: Vec<MovementLink>,
    ) -> Self::Command;
}

pub(crate) fn next_line_no<L>(lines: &[L], line_no: impl Fn(&L) -> u32) -> u32 {
    lines.iter().map(line_no).max().unwrap_or(0) + 1
}

pub(crate) fn ensure_positive(quantity: Decimal, what: &str) -> DomainResult<()> {
    if quantity <= Decimal::ZERO {
        return Err(DomainError::validation(format!("{what} must be positive")));
    }
    Ok(())
}

pub(crate) fn ensure_cost(unit_cost: Decimal) -> DomainResult<()> {
    if unit_cost < Decimal::ZERO {
        return Err(DomainError::validation("unit cost cannot be negative"));
    }
    Ok(())
}

pub(crate) fn ensure_links(links: &[MovementLink], line_exists: impl Fn(u32) -> bool) -> DomainResult<()> {
    if links.is_empty() {
        return Err(DomainError::validation("no movements to link"));
    }
    if let Some(l) = links.iter().find(|l| !line_exists(l.line_no)) {
        return Err(DomainError::validation(format!(
            "movement {} refers to unknown line {}",
            l.movement_id, l.line_no
        )));
    }
    Ok(())
}
