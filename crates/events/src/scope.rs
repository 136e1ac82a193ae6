use stockledger_core::CompanyId;

use crate::EventEnvelope;

/// Messages that belong to exactly one company (tenant).
///
/// Subscribers use it to keep per-company logs and to drop foreign messages.
pub trait CompanyScoped {
    fn company_id(&self) -> CompanyId;
}

impl<E> CompanyScoped for EventEnvelope<E> {
    fn company_id(&self) -> CompanyId {
        self.company_id()
    }
}
