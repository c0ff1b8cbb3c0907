// DuelNotifier boundary - best-effort lifecycle signals to both participants.
// Delivery sits outside the consistency model: a dropped event never affects
// duel state, and clients reconcile from the duel table itself.

use spacetimedb::{
    table, client_visibility_filter, Filter, ReducerContext, Table, Timestamp, SpacetimeType,
};

/// The four lifecycle transitions a client session is told about
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum DuelEventKind {
    DuelInvite,
    DuelAccepted,
    DuelDeclined,
    DuelCompleted,
}

/// One outbound signal to one recipient
/// Clients subscribe to this table; rows are pruned by the retention task
/// after the audit window closes
#[table(name = duel_event, public)]
pub struct DuelEvent {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub duel_id: u64,

    /// Player this signal is addressed to
    #[index(btree)]
    pub recipient_id: String,

    pub kind: DuelEventKind,

    pub emitted_at: Timestamp,
}

/// RLS Filter: recipients only see their own signals
#[client_visibility_filter]
const DUEL_EVENT_VISIBILITY: Filter = Filter::Sql(
    "SELECT e.* FROM duel_event e
     JOIN session s WHERE s.connection_id = :sender AND s.player_id = e.recipient_id"
);

/// Outbound notification seam, passed explicitly into lifecycle and
/// finalization code - no ambient emitter. Implementations must be
/// fire-and-forget: log failures, never propagate them to the caller.
pub trait DuelNotifier {
    fn notify(&self, ctx: &ReducerContext, kind: DuelEventKind, duel_id: u64, recipients: &[String]);
}

/// Production notifier: appends one duel_event row per recipient
pub struct EventLogNotifier;

impl DuelNotifier for EventLogNotifier {
    fn notify(&self, ctx: &ReducerContext, kind: DuelEventKind, duel_id: u64, recipients: &[String]) {
        for recipient in recipients {
            let result = ctx.db.duel_event().try_insert(DuelEvent {
                id: 0, // auto-increment
                duel_id,
                recipient_id: recipient.clone(),
                kind: kind.clone(),
                emitted_at: ctx.timestamp,
            });
            if let Err(e) = result {
                // The lifecycle operation already committed its state change;
                // a dropped signal is logged and forgotten
                log::warn!("[NOTIFY] ✗ dropped event:{:?} duel:{} recipient:{} error:{}",
                    kind, duel_id, &recipient[..8.min(recipient.len())], e);
            }
        }
    }
}
