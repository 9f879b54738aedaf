//! Identity resolution and the transactional upsert.

use std::collections::HashMap;

use cec_core::{
    CanonicalRecord, CategorySchema, EquipmentRecord, NaturalKey, QuarantineEntry,
    QuarantineReason, RunContext,
};
use cec_storage::{ChangeSet, RecordStore, StoreError, StoredIdentity};
use tracing::debug;

use crate::report::RunStats;

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub changes: ChangeSet,
    pub stats: RunStats,
    /// Rows rejected during resolution, e.g. repeated natural keys.
    pub quarantine: Vec<QuarantineEntry>,
}

/// Diff a batch against the stored identities of its category.
///
/// New natural keys receive surrogate ids counting up from the current
/// maximum. A key already seen earlier in the batch is quarantined; the first
/// occurrence wins.
pub fn plan_changes(
    schema: &CategorySchema,
    ctx: &RunContext,
    existing: &HashMap<NaturalKey, StoredIdentity>,
    records: Vec<CanonicalRecord>,
) -> ReconcilePlan {
    let mut next_id = existing.values().map(|i| i.surrogate_id).max().unwrap_or(0) + 1;
    let mut seen: HashMap<NaturalKey, usize> = HashMap::with_capacity(records.len());
    let mut plan = ReconcilePlan::default();

    for record in records {
        let natural_key = match schema.natural_key(&record) {
            Ok(key) => key,
            Err(field) => {
                plan.quarantine.push(QuarantineEntry {
                    row: record.source_row,
                    field: field.to_string(),
                    reason: QuarantineReason::Missing,
                });
                continue;
            }
        };
        if let Some(&first_row) = seen.get(&natural_key) {
            plan.quarantine.push(QuarantineEntry {
                row: record.source_row,
                field: schema.natural_key_fields().join("+"),
                reason: QuarantineReason::DuplicateNaturalKey { first_row },
            });
            continue;
        }
        seen.insert(natural_key.clone(), record.source_row);

        let content_hash = schema.content_hash(&record.attributes);
        match existing.get(&natural_key) {
            Some(stored) if stored.content_hash == content_hash => plan.stats.unchanged += 1,
            Some(stored) => {
                plan.stats.updated += 1;
                plan.changes.updates.push(EquipmentRecord {
                    category: schema.category(),
                    surrogate_id: stored.surrogate_id,
                    natural_key,
                    attributes: record.attributes,
                    content_hash,
                    first_seen_at: stored.first_seen_at,
                    last_updated_at: ctx.started_at,
                });
            }
            None => {
                plan.stats.inserted += 1;
                plan.changes.inserts.push(EquipmentRecord {
                    category: schema.category(),
                    surrogate_id: next_id,
                    natural_key,
                    attributes: record.attributes,
                    content_hash,
                    first_seen_at: ctx.started_at,
                    last_updated_at: ctx.started_at,
                });
                next_id += 1;
            }
        }
    }
    plan.stats.quarantined = plan.quarantine.len();
    plan
}

/// Resolve identities for `records` and commit the resulting inserts and
/// updates as one transaction. On error the category's table is unchanged.
pub async fn reconcile(
    store: &RecordStore,
    schema: &CategorySchema,
    ctx: &RunContext,
    records: Vec<CanonicalRecord>,
) -> Result<ReconcilePlan, StoreError> {
    store.ensure_namespace(schema).await?;
    let existing = store.identities(schema).await?;
    let plan = plan_changes(schema, ctx, &existing, records);
    if plan.changes.is_empty() {
        debug!(category = %schema.category(), "no changes to commit");
    } else {
        store.commit(schema, &plan.changes).await?;
    }
    Ok(plan)
}
