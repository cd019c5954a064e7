use cfin_core::{
    parse_source_date, ConduitFields, Contributor, Entity, FilingMetadata, IndividualFields,
    TransactionRecord,
};
use thiserror::Error;

use crate::{RawCommittee, RawReceipt};

/// A receipt ready for writing, with the entities it references.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptDraft {
    pub record: TransactionRecord,
    pub receiving: Option<Entity>,
    pub contributor: Contributor,
    pub conduit: Option<Entity>,
}

impl ReceiptDraft {
    /// Referenced entities in write order: contributor, receiving, conduit.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.contributor
            .entity()
            .into_iter()
            .chain(self.receiving.as_ref())
            .chain(self.conduit.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    #[error("receipt has no sub_id")]
    MissingId,
    #[error("receipt {0} names neither an individual nor a contributing committee")]
    NoContributor(String),
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn committee_entity(id: String, nested: Option<&RawCommittee>, fallback_name: Option<String>) -> Entity {
    let nested = nested.cloned().unwrap_or_default();
    Entity {
        name: clean(&nested.name).or(fallback_name),
        committee_type: clean(&nested.committee_type),
        designation: clean(&nested.designation),
        party: clean(&nested.party),
        state: clean(&nested.state),
        candidate_ids: nested
            .candidate_ids
            .unwrap_or_default()
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .collect(),
        id,
    }
}

/// Maps one raw receipt onto the relational shape.
///
/// `default_cycle` applies when the receipt omits its two-year period.
pub fn transform_receipt(raw: &RawReceipt, default_cycle: i32) -> Result<ReceiptDraft, DropReason> {
    let external_id = clean(&raw.sub_id).ok_or(DropReason::MissingId)?;

    let individual_name = clean(&raw.contributor_name);
    let contributing_id = raw
        .contributor
        .as_ref()
        .and_then(|c| clean(&c.committee_id))
        .or_else(|| clean(&raw.contributor_id));
    if individual_name.is_none() && contributing_id.is_none() {
        return Err(DropReason::NoContributor(external_id));
    }

    let is_individual = raw.is_individual.unwrap_or(false);
    let contributor = match contributing_id {
        Some(id) if !is_individual => Contributor::Organization(committee_entity(
            id,
            raw.contributor.as_ref(),
            individual_name.clone(),
        )),
        _ => Contributor::Individual,
    };

    let receiving_id = clean(&raw.committee_id)
        .or_else(|| raw.committee.as_ref().and_then(|c| clean(&c.committee_id)));
    let receiving = receiving_id.clone().map(|id| committee_entity(id, raw.committee.as_ref(), None));

    let conduit_id = clean(&raw.conduit_committee_id);
    let conduit = conduit_id.clone().map(|id| Entity {
        id,
        name: clean(&raw.conduit_committee_name),
        state: clean(&raw.conduit_committee_state),
        ..Entity::default()
    });

    let record = TransactionRecord {
        external_id,
        committee_id: receiving_id,
        amount: raw.contribution_receipt_amount.unwrap_or(0.0),
        transaction_date: raw
            .contribution_receipt_date
            .as_deref()
            .and_then(parse_source_date),
        cycle: raw.two_year_transaction_period.unwrap_or(default_cycle),
        contributor_id: contributor.entity().map(|e| e.id.clone()),
        is_individual,
        individual: IndividualFields {
            name: individual_name,
            street_1: clean(&raw.contributor_street_1),
            street_2: clean(&raw.contributor_street_2),
            city: clean(&raw.contributor_city),
            state: clean(&raw.contributor_state),
            zip: clean(&raw.contributor_zip),
            employer: clean(&raw.contributor_employer),
            occupation: clean(&raw.contributor_occupation),
        },
        conduit: ConduitFields {
            committee_id: conduit_id,
            name: clean(&raw.conduit_committee_name),
            city: clean(&raw.conduit_committee_city),
            state: clean(&raw.conduit_committee_state),
            street_1: clean(&raw.conduit_committee_street1),
            street_2: clean(&raw.conduit_committee_street2),
            zip: clean(&raw.conduit_committee_zip),
        },
        filing: FilingMetadata {
            memo_code: clean(&raw.memo_code),
            memoed_subtotal: raw.memoed_subtotal.unwrap_or(false),
            file_number: raw.file_number,
            image_number: clean(&raw.image_number),
            pdf_url: clean(&raw.pdf_url),
            filing_form: clean(&raw.filing_form),
            election_type: clean(&raw.election_type),
            schedule_type: clean(&raw.schedule_type),
            line_number: clean(&raw.line_number),
            receipt_type: clean(&raw.receipt_type),
            report_type: clean(&raw.report_type),
            report_year: raw.report_year,
        },
        load_date: raw.load_date.as_deref().and_then(parse_source_date),
    };

    Ok(ReceiptDraft {
        record,
        receiving,
        contributor,
        conduit,
    })
}
