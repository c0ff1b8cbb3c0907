use spacetimedb::{
    ReducerContext, Identity, Table, Timestamp, ScheduleAt,
    table, reducer, view, SpacetimeType, rand::Rng,
};
use std::fmt;

// Lifecycle notification boundary (event-log backed, injected into reducers)
mod notifier;
use notifier::{duel_event, DuelEventKind, DuelNotifier, EventLogNotifier};

// Bulk restore reducers for disaster recovery
mod restore;

// ==================== CONSTANTS ====================

/// How long a pending challenge stays acceptable before it lapses
const CHALLENGE_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Ceiling for a single response time (slowest plausible answer; keeps
/// cumulative totals meaningful if a client clock misbehaves)
const MAX_RESPONSE_TIME_MS: u32 = 300_000;

/// Notification log rows are pruned this many days after emission
const EVENT_RETENTION_DAYS: i64 = 7;

// ==================== ERRORS ====================

/// Rejection taxonomy for duel operations. Reducers return Result<(), String>;
/// `?` converts through From<DuelError> so callers see stable one-line messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuelError {
    /// Challenger's vocabulary is smaller than the requested word count
    InsufficientWords,
    /// Actor is not the participant required for the attempted transition
    Unauthorized,
    /// Accept/decline attempted after the pending window lapsed
    Expired,
    /// Re-submission of an already-answered word index (client bug)
    DuplicateResponse,
    /// Answer submitted to a duel that is not active
    NotActive,
    /// Unknown duel id
    NotFound,
}

impl fmt::Display for DuelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DuelError::InsufficientWords => "insufficient vocabulary for requested word count",
            DuelError::Unauthorized => "not permitted for this actor in the current state",
            DuelError::Expired => "challenge window has expired",
            DuelError::DuplicateResponse => "word already answered by this player",
            DuelError::NotActive => "duel is not active",
            DuelError::NotFound => "duel not found",
        };
        write!(f, "{}", msg)
    }
}

impl From<DuelError> for String {
    fn from(e: DuelError) -> Self {
        e.to_string()
    }
}

// ==================== HELPER FUNCTIONS ====================

/// Get player from session using the sender's identity
/// This abstracts the session lookup pattern used throughout reducers
fn get_player(ctx: &ReducerContext) -> Result<Player, String> {
    let session = ctx.db.session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or("No session found".to_string())?;

    ctx.db.player()
        .id()
        .find(&session.player_id)
        .ok_or("Player not found".to_string())
}

fn load_duel(ctx: &ReducerContext, duel_id: u64) -> Result<Duel, DuelError> {
    ctx.db.duel().id().find(&duel_id).ok_or(DuelError::NotFound)
}

/// Lazy-expiry projection: a pending duel past its window reads as expired.
/// No background process expires pending duels - this rule is applied on
/// every reducer touch and mirrored by subscribed clients.
fn effective_status(duel: &Duel, now: Timestamp) -> DuelStatus {
    if matches!(duel.status, DuelStatus::Pending)
        && now.to_micros_since_unix_epoch() > duel.expires_at.to_micros_since_unix_epoch()
    {
        DuelStatus::Expired
    } else {
        duel.status.clone()
    }
}

/// Materialize the lazy-expiry projection for a freshly read duel.
/// Expired is terminal, so writing it on first observation keeps the stored
/// status monotonic with what every reader has already been told.
fn expire_if_stale(ctx: &ReducerContext, mut duel: Duel) -> Duel {
    if matches!(duel.status, DuelStatus::Pending)
        && matches!(effective_status(&duel, ctx.timestamp), DuelStatus::Expired)
    {
        duel.status = DuelStatus::Expired;
        ctx.db.duel().id().update(duel.clone());
        log::info!("[DUEL] expired duel:{} (pending window lapsed)", duel.id);
    }
    duel
}

fn duel_role(duel: &Duel, user_id: &str) -> Option<DuelRole> {
    if duel.challenger_id == user_id {
        Some(DuelRole::Challenger)
    } else if duel.opponent_id == user_id {
        Some(DuelRole::Opponent)
    } else {
        None
    }
}

/// Draw a uniformly random subset of `n` words, without replacement, from the
/// owner's vocabulary. The caller freezes the result into duel_word rows.
fn sample_vocabulary(
    ctx: &ReducerContext,
    owner_id: &str,
    n: usize,
) -> Result<Vec<VocabWord>, DuelError> {
    let mut pool: Vec<VocabWord> = ctx.db.vocab_word()
        .owner_id()
        .filter(&owner_id.to_string())
        .collect();

    if pool.len() < n {
        return Err(DuelError::InsufficientWords);
    }

    // Partial Fisher-Yates: the first n slots end up uniformly drawn
    let mut rng = ctx.rng();
    for i in 0..n {
        let j = rng.gen_range(i..pool.len());
        pool.swap(i, j);
    }
    pool.truncate(n);
    Ok(pool)
}

// ==================== TABLES ====================

/// Session links ephemeral connection to stable player
/// PRIVATE: Links connection identity to player ID (no PII)
#[table(name = session)]
pub struct Session {
    #[primary_key]
    pub connection_id: Identity,

    /// Stable player ID - verified by gateway
    pub player_id: String,

    /// When this session was created
    pub connected_at: Timestamp,
}

/// Thin player profile with duel tallies
/// PRIVATE: Clients access via my_player view
#[table(name = player)]
#[derive(Clone)]
pub struct Player {
    #[primary_key]
    pub id: String,

    /// Display name
    pub name: String,

    /// Duels finalized with this player as a participant
    pub total_duels: u32,

    /// Duels finalized with this player as the winner
    pub duels_won: u32,

    pub created_at: Timestamp,
    pub last_seen: Timestamp,
}

/// Authorized identities that can access protected tables and admin reducers
/// Used for reducer authorization checks (gateway, restore tooling)
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// One vocabulary entry owned by a player
/// PRIVATE: prompts and answers are only exposed once frozen into a duel
#[table(name = vocab_word)]
#[derive(Clone)]
pub struct VocabWord {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub owner_id: String,

    pub prompt: String,
    pub expected_answer: String,
    pub created_at: Timestamp,
}

/// One two-player word challenge
#[table(name = duel, public)]
#[derive(Clone)]
pub struct Duel {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// Player who issued the challenge; supplies the word snapshot
    #[index(btree)]
    pub challenger_id: String,

    /// Player who must accept or decline
    #[index(btree)]
    pub opponent_id: String,

    pub status: DuelStatus,

    /// Number of words in the frozen snapshot, fixed at creation
    pub word_count: u32,

    /// Correct-answer counts, derived from duel_response (never incremented ad hoc)
    pub challenger_score: u32,
    pub opponent_score: u32,

    /// Cumulative response-time totals in milliseconds
    pub challenger_time_ms: u64,
    pub opponent_time_ms: u64,

    /// Set exactly once at finalization; None on a completed duel means a draw
    pub winner_id: Option<String>,

    /// Pending challenges lapse after this instant (observed lazily on read)
    pub expires_at: Timestamp,

    /// Set on acceptance
    pub started_at: Option<Timestamp>,

    /// Set at finalization
    pub completed_at: Option<Timestamp>,

    pub created_at: Timestamp,
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum DuelStatus {
    Pending,    // Waiting for the opponent to accept or decline
    Active,     // Both sides answering independently
    Completed,  // Finalized; winner_id populated (None = draw)
    Declined,   // Opponent refused (terminal)
    Expired,    // Pending window lapsed (terminal)
}

/// One word of a duel's frozen snapshot
/// Immutable once inserted: both players are scored against the same fixed
/// test even if the challenger's vocabulary changes mid-duel.
/// Public so each client can grade its own answers locally before submitting.
#[table(
    name = duel_word,
    public,
    index(name = idx_duel_index, btree(columns = [duel_id, word_index]))
)]
pub struct DuelWord {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub duel_id: u64,

    /// 0-based position in the snapshot, < word_count
    pub word_index: u32,

    /// Vocabulary row this word was drawn from at creation time
    pub word_id: u64,

    pub prompt: String,
    pub expected_answer: String,
}

/// One participant's graded answer to one word
/// Note: No composite unique constraint on (duel_id, user_id, word_index) -
/// submit_answer checks for a prior row manually inside its transaction.
#[table(
    name = duel_response,
    public,
    index(name = idx_duel_user, btree(columns = [duel_id, user_id]))
)]
#[derive(Clone)]
pub struct DuelResponse {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub duel_id: u64,

    #[index(btree)]
    pub user_id: String,

    /// 0-based index into the duel's word snapshot
    pub word_index: u32,

    /// Graded client-side against the frozen expected_answer
    pub is_correct: bool,

    /// Clamped to MAX_RESPONSE_TIME_MS on ingestion
    pub response_time_ms: u32,

    pub submitted_at: Timestamp,
}

/// Schedule table for notification-log retention
#[table(name = event_retention_schedule, scheduled(prune_duel_events))]
pub struct EventRetentionSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// When to run the retention pass
    pub scheduled_at: ScheduleAt,
}

// ==================== VIEWS ====================

/// View: Returns only the current user's player data
#[view(name = my_player, public)]
fn my_player(ctx: &spacetimedb::ViewContext) -> Option<Player> {
    let session = ctx.db.session().connection_id().find(ctx.sender)?;
    ctx.db.player().id().find(&session.player_id)
}

// ==================== SESSION REDUCERS ====================

/// Create a verified session for a client identity
/// Called by the gateway AFTER verifying the login token
/// Only authorized workers (gateway with owner token) can call this
#[reducer]
pub fn create_session(ctx: &ReducerContext, client_identity: String, player_id: String) {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        panic!("Unauthorized: only gateway can create sessions");
    }

    let identity = Identity::from_hex(&client_identity)
        .expect("Invalid identity hex string");

    // Delete stale sessions: same player (unclean reconnect) OR same
    // connection_id (prevents PK conflict)
    let stale_sessions: Vec<_> = ctx.db.session()
        .iter()
        .filter(|s| s.player_id == player_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale_sessions {
        ctx.db.session().connection_id().delete(&conn_id);
    }

    ctx.db.session().insert(Session {
        connection_id: identity,
        player_id: player_id.clone(),
        connected_at: ctx.timestamp,
    });

    log::info!("[SESSION] created player:{} ws:{}",
        &player_id[..8.min(player_id.len())],
        &client_identity[..8.min(client_identity.len())]);
}

/// Player connects; get-or-create the profile bound to the verified session
#[reducer]
pub fn connect(ctx: &ReducerContext, name: String) {
    let session = ctx.db.session()
        .connection_id()
        .find(&ctx.sender)
        .expect("Session not found - verify with gateway first");

    let player_id = session.player_id.clone();
    let pid = &player_id[..8.min(player_id.len())];

    if let Some(mut existing) = ctx.db.player().id().find(&player_id) {
        existing.name = name;
        existing.last_seen = ctx.timestamp;
        let (duels, won) = (existing.total_duels, existing.duels_won);
        ctx.db.player().id().update(existing);
        log::info!("[CONNECT] player_id={} type=returning duels={} won={}", pid, duels, won);
    } else {
        ctx.db.player().insert(Player {
            id: player_id.clone(),
            name,
            total_duels: 0,
            duels_won: 0,
            created_at: ctx.timestamp,
            last_seen: ctx.timestamp,
        });
        log::info!("[CONNECT] player_id={} type=new", pid);
    }
}

/// Clean up session when player disconnects
/// A duel in flight is untouched: disconnection is indistinguishable from
/// "still thinking" and the duel waits for the player's remaining answers
#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    if let Some(session) = ctx.db.session().connection_id().find(&ctx.sender) {
        let session_duration_secs = ctx.timestamp.duration_since(session.connected_at)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        log::info!("[DISCONNECT] player:{} session_min:{:.1}",
            &session.player_id[..8.min(session.player_id.len())],
            session_duration_secs as f32 / 60.0);
        ctx.db.session().connection_id().delete(&ctx.sender);
    }
}

// ==================== CHALLENGE LIFECYCLE ====================

/// Issue a challenge: freeze a random word snapshot from the challenger's
/// vocabulary and invite the opponent
#[reducer]
pub fn create_challenge(
    ctx: &ReducerContext,
    opponent_id: String,
    word_count: u32,
) -> Result<(), String> {
    let challenger = get_player(ctx)?;

    if challenger.id == opponent_id {
        return Err("cannot challenge yourself".to_string());
    }
    if word_count == 0 {
        return Err("word_count must be positive".to_string());
    }
    if ctx.db.player().id().find(&opponent_id).is_none() {
        return Err("opponent not found".to_string());
    }

    let words = sample_vocabulary(ctx, &challenger.id, word_count as usize)?;

    let expires_at = ctx.timestamp + std::time::Duration::from_secs(CHALLENGE_WINDOW_SECS);

    let duel = ctx.db.duel().insert(Duel {
        id: 0, // Auto-increment
        challenger_id: challenger.id.clone(),
        opponent_id: opponent_id.clone(),
        status: DuelStatus::Pending,
        word_count,
        challenger_score: 0,
        opponent_score: 0,
        challenger_time_ms: 0,
        opponent_time_ms: 0,
        winner_id: None,
        expires_at,
        started_at: None,
        completed_at: None,
        created_at: ctx.timestamp,
    });

    // Freeze the snapshot: word order is the play order for both sides
    for (i, w) in words.iter().enumerate() {
        ctx.db.duel_word().insert(DuelWord {
            id: 0,
            duel_id: duel.id,
            word_index: i as u32,
            word_id: w.id,
            prompt: w.prompt.clone(),
            expected_answer: w.expected_answer.clone(),
        });
    }

    let notifier = EventLogNotifier;
    notifier.notify(ctx, DuelEventKind::DuelInvite, duel.id,
        &[duel.challenger_id.clone(), duel.opponent_id.clone()]);

    let expires_iso = chrono::DateTime::from_timestamp_micros(expires_at.to_micros_since_unix_epoch())
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "invalid".to_string());
    log::info!("[DUEL] created duel:{} challenger:{} opponent:{} words:{} expires:{}",
        duel.id, &challenger.id[..8.min(challenger.id.len())],
        &opponent_id[..8.min(opponent_id.len())], word_count, expires_iso);

    Ok(())
}

/// Opponent accepts a pending challenge; the duel becomes active for both sides
#[reducer]
pub fn accept_challenge(ctx: &ReducerContext, duel_id: u64) -> Result<(), String> {
    let actor = get_player(ctx)?;

    let duel = expire_if_stale(ctx, load_duel(ctx, duel_id)?);
    if matches!(duel.status, DuelStatus::Expired) {
        return Err(DuelError::Expired.into());
    }

    // Actor/status guard. Re-checking status inside this transaction is the
    // conditional update: a concurrent accept/decline that committed first
    // leaves status != Pending and this call rejects instead of
    // double-transitioning.
    if actor.id != duel.opponent_id || !matches!(duel.status, DuelStatus::Pending) {
        log::warn!("[DUEL] ✗ accept rejected duel:{} actor:{} status:{:?}",
            duel.id, &actor.id[..8.min(actor.id.len())], duel.status);
        return Err(DuelError::Unauthorized.into());
    }

    let mut duel = duel;
    duel.status = DuelStatus::Active;
    duel.started_at = Some(ctx.timestamp);
    ctx.db.duel().id().update(duel.clone());

    let notifier = EventLogNotifier;
    notifier.notify(ctx, DuelEventKind::DuelAccepted, duel.id,
        &[duel.challenger_id.clone(), duel.opponent_id.clone()]);

    log::info!("[DUEL] accepted duel:{} opponent:{}",
        duel.id, &actor.id[..8.min(actor.id.len())]);
    Ok(())
}

/// Opponent declines a pending challenge (terminal)
#[reducer]
pub fn decline_challenge(ctx: &ReducerContext, duel_id: u64) -> Result<(), String> {
    let actor = get_player(ctx)?;

    let duel = expire_if_stale(ctx, load_duel(ctx, duel_id)?);
    if matches!(duel.status, DuelStatus::Expired) {
        return Err(DuelError::Expired.into());
    }

    // Same actor/status guard as accept
    if actor.id != duel.opponent_id || !matches!(duel.status, DuelStatus::Pending) {
        log::warn!("[DUEL] ✗ decline rejected duel:{} actor:{} status:{:?}",
            duel.id, &actor.id[..8.min(actor.id.len())], duel.status);
        return Err(DuelError::Unauthorized.into());
    }

    let mut duel = duel;
    duel.status = DuelStatus::Declined;
    ctx.db.duel().id().update(duel.clone());

    let notifier = EventLogNotifier;
    notifier.notify(ctx, DuelEventKind::DuelDeclined, duel.id,
        &[duel.challenger_id.clone(), duel.opponent_id.clone()]);

    log::info!("[DUEL] declined duel:{} opponent:{}",
        duel.id, &actor.id[..8.min(actor.id.len())]);
    Ok(())
}

// ==================== ANSWER INGESTION ====================

/// Submit one timed, client-graded answer for one word of an active duel
#[reducer]
pub fn submit_answer(
    ctx: &ReducerContext,
    duel_id: u64,
    word_index: u32,
    is_correct: bool,
    response_time_ms: u32,
) -> Result<(), String> {
    let actor = get_player(ctx)?;

    let duel = expire_if_stale(ctx, load_duel(ctx, duel_id)?);

    if !matches!(duel.status, DuelStatus::Active) {
        log::warn!("[DUEL] ✗ answer rejected duel:{} status:{:?}", duel.id, duel.status);
        return Err(DuelError::NotActive.into());
    }

    let role = match duel_role(&duel, &actor.id) {
        Some(r) => r,
        None => {
            log::warn!("[DUEL] ✗ answer from non-participant duel:{} actor:{}",
                duel.id, &actor.id[..8.min(actor.id.len())]);
            return Err(DuelError::Unauthorized.into());
        }
    };

    if word_index >= duel.word_count {
        return Err(format!(
            "word_index {} out of range (word_count {})", word_index, duel.word_count));
    }

    let response_time_ms = response_time_ms.min(MAX_RESPONSE_TIME_MS);

    // Append-once check. No composite unique constraint exists, so look for a
    // prior row inside this transaction; a silent overwrite would corrupt the
    // derived scores.
    let already_answered = ctx.db.duel_response()
        .duel_id()
        .filter(&duel.id)
        .any(|r| r.user_id == actor.id && r.word_index == word_index);

    if already_answered {
        log::warn!("[DUEL] ✗ duplicate response duel:{} player:{} word:{}",
            duel.id, &actor.id[..8.min(actor.id.len())], word_index);
        return Err(DuelError::DuplicateResponse.into());
    }

    ctx.db.duel_response().insert(DuelResponse {
        id: 0, // auto-increment
        duel_id: duel.id,
        user_id: actor.id.clone(),
        word_index,
        is_correct,
        response_time_ms,
        submitted_at: ctx.timestamp,
    });

    // Recompute this player's totals from the full log rather than
    // incrementing, so out-of-order delivery cannot skew them
    let responses: Vec<DuelResponse> = ctx.db.duel_response()
        .duel_id()
        .filter(&duel.id)
        .collect();
    let (score, time_ms) = recompute_totals(&responses, &actor.id);

    let mut duel = duel;
    match role {
        DuelRole::Challenger => {
            duel.challenger_score = score;
            duel.challenger_time_ms = time_ms;
        }
        DuelRole::Opponent => {
            duel.opponent_score = score;
            duel.opponent_time_ms = time_ms;
        }
    }
    ctx.db.duel().id().update(duel.clone());

    // Completion check runs after every ingested answer; when the two last
    // answers race, the finalizer's status guard makes the second evaluation
    // a no-op
    let challenger_done =
        answered_count(&responses, &duel.challenger_id, duel.word_count) == duel.word_count;
    let opponent_done =
        answered_count(&responses, &duel.opponent_id, duel.word_count) == duel.word_count;
    if challenger_done && opponent_done {
        let notifier = EventLogNotifier;
        finalize_duel(ctx, duel.id, &notifier);
    }

    Ok(())
}

// ==================== COMPLETION & WINNER ====================

/// Participant role within one duel; fixed at creation, never swapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuelRole {
    Challenger,
    Opponent,
}

/// A participant's derived totals from the response log:
/// (correct count, cumulative time in ms)
fn recompute_totals(responses: &[DuelResponse], user_id: &str) -> (u32, u64) {
    let mut score = 0u32;
    let mut time_ms = 0u64;
    for r in responses.iter().filter(|r| r.user_id == user_id) {
        if r.is_correct {
            score += 1;
        }
        time_ms = time_ms.saturating_add(r.response_time_ms as u64);
    }
    (score, time_ms)
}

/// Distinct word indexes answered by a participant (out-of-range rows ignored)
fn answered_count(responses: &[DuelResponse], user_id: &str, word_count: u32) -> u32 {
    let mut seen = vec![false; word_count as usize];
    let mut count = 0u32;
    for r in responses.iter().filter(|r| r.user_id == user_id) {
        let idx = r.word_index as usize;
        if idx < seen.len() && !seen[idx] {
            seen[idx] = true;
            count += 1;
        }
    }
    count
}

/// Winner determination: higher score wins; on equal scores the lower
/// cumulative time wins; equal on both is a draw. The ordering is total and
/// deterministic - racing finalization paths compute the same outcome from
/// the same totals.
fn resolve_winner(
    challenger_score: u32,
    opponent_score: u32,
    challenger_time_ms: u64,
    opponent_time_ms: u64,
) -> Option<DuelRole> {
    if challenger_score != opponent_score {
        return Some(if challenger_score > opponent_score {
            DuelRole::Challenger
        } else {
            DuelRole::Opponent
        });
    }
    if challenger_time_ms != opponent_time_ms {
        return Some(if challenger_time_ms < opponent_time_ms {
            DuelRole::Challenger
        } else {
            DuelRole::Opponent
        });
    }
    None
}

/// One-time transition of a fully answered duel to Completed.
/// Safe to call from concurrent submit paths: only the caller that still
/// observes Active performs the transition; any other caller sees the
/// terminal record and returns without touching it.
fn finalize_duel(ctx: &ReducerContext, duel_id: u64, notifier: &dyn DuelNotifier) {
    let mut duel = match ctx.db.duel().id().find(&duel_id) {
        Some(d) => d,
        None => {
            log::error!("finalize_duel: duel {} not found", duel_id);
            return;
        }
    };

    // Status guard - the conditional update that resolves the finalization race
    if !matches!(duel.status, DuelStatus::Active) {
        log::warn!("finalize_duel: duel {} already in {:?}, ignoring duplicate call",
            duel_id, duel.status);
        return;
    }

    let winner_id = resolve_winner(
        duel.challenger_score,
        duel.opponent_score,
        duel.challenger_time_ms,
        duel.opponent_time_ms,
    )
    .map(|role| match role {
        DuelRole::Challenger => duel.challenger_id.clone(),
        DuelRole::Opponent => duel.opponent_id.clone(),
    });

    // State first, then side effects: a duplicate finalize call hits the
    // guard above as soon as this update commits
    duel.status = DuelStatus::Completed;
    duel.completed_at = Some(ctx.timestamp);
    duel.winner_id = winner_id.clone();
    ctx.db.duel().id().update(duel.clone());

    // Participant tallies (skip silently for restored duels without profiles)
    for pid in [&duel.challenger_id, &duel.opponent_id] {
        if let Some(mut player) = ctx.db.player().id().find(pid) {
            player.total_duels = player.total_duels.saturating_add(1);
            if winner_id.as_deref() == Some(pid.as_str()) {
                player.duels_won = player.duels_won.saturating_add(1);
            }
            ctx.db.player().id().update(player);
        }
    }

    notifier.notify(ctx, DuelEventKind::DuelCompleted, duel.id,
        &[duel.challenger_id.clone(), duel.opponent_id.clone()]);

    // Wide event: one canonical log for duel outcome
    let outcome = match &winner_id {
        Some(id) => &id[..8.min(id.len())],
        None => "draw",
    };
    log::info!("[DUEL] completed duel:{} outcome:{} challenger:{}/{} time:{}ms opponent:{}/{} time:{}ms",
        duel.id, outcome,
        duel.challenger_score, duel.word_count, duel.challenger_time_ms,
        duel.opponent_score, duel.word_count, duel.opponent_time_ms);
}

// ==================== MAINTENANCE ====================

/// Prune notification-log rows past the retention window (scheduled).
/// Pending duels are deliberately NOT swept here: expiry is observed lazily
/// on read, never applied by a background process.
#[reducer]
pub fn prune_duel_events(ctx: &ReducerContext, _schedule: EventRetentionSchedule) {
    // Only allow scheduler to call this, not clients
    if ctx.sender != ctx.identity() {
        log::warn!("Client {} attempted to call prune_duel_events", ctx.sender);
        return;
    }

    let retention_micros: i64 = EVENT_RETENTION_DAYS * 24 * 60 * 60 * 1_000_000;
    let now_micros = ctx.timestamp.to_micros_since_unix_epoch();

    let stale: Vec<u64> = ctx.db.duel_event()
        .iter()
        .filter(|e| now_micros - e.emitted_at.to_micros_since_unix_epoch() > retention_micros)
        .map(|e| e.id)
        .collect();

    if !stale.is_empty() {
        let count = stale.len();
        for id in stale {
            ctx.db.duel_event().id().delete(&id);
        }
        log::info!("[NOTIFY] pruned {} stale events", count);
    }
}

/// Initialize module - set up scheduled tasks
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity; register it so the
    // gateway and restore tooling pass the authorization checks
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    // Hourly retention pass over the notification log
    // Check if scheduler already exists to avoid duplicates on hot-reload
    if ctx.db.event_retention_schedule().iter().count() == 0 {
        ctx.db.event_retention_schedule().insert(EventRetentionSchedule {
            id: 0, // auto_inc will handle this
            scheduled_at: ScheduleAt::Interval(std::time::Duration::from_secs(3600).into()),
        });
    }

    log::info!("Word Duel module initialized successfully");
}

// ==================== TESTS ====================

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros_since_unix_epoch(micros)
    }

    fn resp(user: &str, word_index: u32, is_correct: bool, response_time_ms: u32) -> DuelResponse {
        DuelResponse {
            id: 0,
            duel_id: 1,
            user_id: user.to_string(),
            word_index,
            is_correct,
            response_time_ms,
            submitted_at: ts(0),
        }
    }

    fn pending_duel(expires_at_micros: i64) -> Duel {
        Duel {
            id: 1,
            challenger_id: "alice".to_string(),
            opponent_id: "bob".to_string(),
            status: DuelStatus::Pending,
            word_count: 5,
            challenger_score: 0,
            opponent_score: 0,
            challenger_time_ms: 0,
            opponent_time_ms: 0,
            winner_id: None,
            expires_at: ts(expires_at_micros),
            started_at: None,
            completed_at: None,
            created_at: ts(0),
        }
    }

    #[test]
    fn test_winner_by_score() {
        assert_eq!(resolve_winner(5, 3, 9999, 1), Some(DuelRole::Challenger));
        assert_eq!(resolve_winner(4, 5, 1, 9999), Some(DuelRole::Opponent));
        assert_eq!(resolve_winner(0, 1, 0, 0), Some(DuelRole::Opponent));
    }

    #[test]
    fn test_winner_time_tiebreak() {
        // Equal accuracy: the faster side wins
        assert_eq!(resolve_winner(5, 5, 1000, 1200), Some(DuelRole::Challenger));
        assert_eq!(resolve_winner(5, 5, 1200, 1000), Some(DuelRole::Opponent));
    }

    #[test]
    fn test_winner_draw() {
        assert_eq!(resolve_winner(5, 5, 1200, 1200), None);
        assert_eq!(resolve_winner(0, 0, 0, 0), None);
    }

    #[test]
    fn test_winner_deterministic() {
        // Racing finalization paths must agree on the outcome
        for _ in 0..3 {
            assert_eq!(resolve_winner(3, 3, 5000, 5000), None);
            assert_eq!(resolve_winner(5, 3, 4000, 6000), Some(DuelRole::Challenger));
        }
    }

    #[test]
    fn test_totals_derived_from_log() {
        let log = vec![
            resp("alice", 0, true, 700),
            resp("alice", 1, false, 900),
            resp("bob", 0, true, 1200),
            resp("alice", 2, true, 400),
        ];
        assert_eq!(recompute_totals(&log, "alice"), (2, 2000));
        assert_eq!(recompute_totals(&log, "bob"), (1, 1200));
        assert_eq!(recompute_totals(&log, "carol"), (0, 0));
    }

    #[test]
    fn test_totals_out_of_order() {
        // Submission order does not matter - totals come from the full log
        let forward = vec![
            resp("alice", 0, true, 500),
            resp("alice", 1, true, 600),
            resp("alice", 2, false, 700),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(
            recompute_totals(&forward, "alice"),
            recompute_totals(&reversed, "alice")
        );
    }

    #[test]
    fn test_answered_count_distinct() {
        let log = vec![
            resp("alice", 0, true, 500),
            resp("alice", 0, false, 600), // duplicate index never double counts
            resp("alice", 3, true, 700),
            resp("alice", 99, true, 100), // out of range, ignored
        ];
        assert_eq!(answered_count(&log, "alice", 5), 2);
        assert_eq!(answered_count(&log, "bob", 5), 0);
    }

    #[test]
    fn test_completion_requires_both_sides() {
        let mut log: Vec<DuelResponse> = (0..5).map(|i| resp("alice", i, true, 500)).collect();
        assert_eq!(answered_count(&log, "alice", 5), 5);
        assert_eq!(answered_count(&log, "bob", 5), 0);

        for i in 0..4 {
            log.push(resp("bob", i, true, 800));
        }
        assert_eq!(answered_count(&log, "bob", 5), 4);

        // Correctness is irrelevant to completion - only coverage counts
        log.push(resp("bob", 4, false, 800));
        assert_eq!(answered_count(&log, "bob", 5), 5);
    }

    #[test]
    fn test_happy_path_outcome() {
        // A answers 5/5 in 4000ms total, B answers 3/5 in 6000ms total
        let mut log: Vec<DuelResponse> = (0..5).map(|i| resp("a", i, true, 800)).collect();
        for i in 0..5 {
            log.push(resp("b", i, i < 3, 1200));
        }
        let (a_score, a_time) = recompute_totals(&log, "a");
        let (b_score, b_time) = recompute_totals(&log, "b");
        assert_eq!((a_score, a_time), (5, 4000));
        assert_eq!((b_score, b_time), (3, 6000));
        assert_eq!(
            resolve_winner(a_score, b_score, a_time, b_time),
            Some(DuelRole::Challenger)
        );
    }

    #[test]
    fn test_draw_outcome() {
        // Both 3/5 correct at 5000ms total
        let mut log: Vec<DuelResponse> = (0..5).map(|i| resp("a", i, i < 3, 1000)).collect();
        for i in 0..5 {
            log.push(resp("b", i, i < 3, 1000));
        }
        let (a_score, a_time) = recompute_totals(&log, "a");
        let (b_score, b_time) = recompute_totals(&log, "b");
        assert_eq!((a_score, a_time), (3, 5000));
        assert_eq!((b_score, b_time), (3, 5000));
        assert_eq!(resolve_winner(a_score, b_score, a_time, b_time), None);
    }

    #[test]
    fn test_lazy_expiry_projection() {
        let duel = pending_duel(1_000_000);
        assert_eq!(effective_status(&duel, ts(999_999)), DuelStatus::Pending);
        // Boundary instant is still pending; only strictly-after expires
        assert_eq!(effective_status(&duel, ts(1_000_000)), DuelStatus::Pending);
        assert_eq!(effective_status(&duel, ts(1_000_001)), DuelStatus::Expired);
    }

    #[test]
    fn test_projection_only_touches_pending() {
        let mut duel = pending_duel(1_000_000);
        duel.status = DuelStatus::Active;
        assert_eq!(effective_status(&duel, ts(2_000_000)), DuelStatus::Active);
        duel.status = DuelStatus::Declined;
        assert_eq!(effective_status(&duel, ts(2_000_000)), DuelStatus::Declined);
        duel.status = DuelStatus::Completed;
        assert_eq!(effective_status(&duel, ts(2_000_000)), DuelStatus::Completed);
    }

    #[test]
    fn test_roles() {
        let duel = pending_duel(0);
        assert_eq!(duel_role(&duel, "alice"), Some(DuelRole::Challenger));
        assert_eq!(duel_role(&duel, "bob"), Some(DuelRole::Opponent));
        assert_eq!(duel_role(&duel, "mallory"), None);
    }

    #[test]
    fn test_score_bounded_by_word_count() {
        // Even a polluted log cannot push a score past word_count distinct words:
        // the ingestion path rejects duplicates, so a well-formed log has at
        // most word_count rows per player
        let log: Vec<DuelResponse> = (0..5).map(|i| resp("a", i, true, 100)).collect();
        let (score, _) = recompute_totals(&log, "a");
        assert!(score <= 5);
        assert_eq!(answered_count(&log, "a", 5), 5);
    }
}
