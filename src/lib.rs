use spacetimedb::{
    client_visibility_filter, reducer, table, view, Filter, Identity, ReducerContext, ScheduleAt,
    SpacetimeType, Table, Timestamp,
    rand::Rng,
};

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc};

// Leveling curve, head-start formula and session XP policy
mod progression;
use progression::{head_start_xp, level_for_xp, prestige_title, session_xp};

// Admin catalog surface (template CRUD, community goal launches)
mod catalog;

// Bulk restore reducers for disaster recovery
mod restore;

// ==================== CONSTANTS ====================

/// Daily operation slots per user
const DAILY_OPERATION_SLOTS: usize = 3;

/// Weekly operation slots per user
const WEEKLY_OPERATION_SLOTS: usize = 1;

/// Reroll tokens replenished at the first scheduled tick of each UTC day
const DAILY_REROLL_ALLOWANCE: u32 = 1;

/// Whether weekly operations can be rerolled. Product left this ambiguous,
/// so it is a flag rather than a hardcoded rule. Dailies are always
/// rerollable.
const WEEKLY_REROLL_ENABLED: bool = false;

/// Expired instance rows and finished community goals are purged after this
const RETENTION_DAYS: i64 = 14;

/// Assignment/reroll-replenish tick interval
const ASSIGNMENT_TICK_SECS: u64 = 60 * 60;

/// Cleanup tick interval
const CLEANUP_TICK_SECS: u64 = 6 * 60 * 60;

const MICROS_PER_DAY: i64 = 24 * 60 * 60 * 1_000_000;

// ==================== TYPES ====================

/// How often an operation template recurs. The cadence fixes the window an
/// assigned instance lives in: daily = one UTC calendar day, weekly = Monday
/// 00:00 UTC for seven days.
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum Cadence {
    Daily,
    Weekly,
}

/// Metric channel an operation measures. Progress deltas come from completed
/// workout sessions: one `Workouts` unit per session, plus the session's
/// aggregated volume (kg), distance (km) and duration (minutes).
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum Metric {
    Workouts,
    Volume,
    Distance,
    Duration,
}

/// Lifecycle of a launched community goal
#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum GoalStatus {
    Active,
    Completed,
    Expired,
}

// ==================== TABLES ====================

/// Session links ephemeral connection to stable user
/// PRIVATE: Links connection identity to user ID (no PII)
#[table(name = session)]
pub struct Session {
    #[primary_key]
    pub connection_id: Identity,

    /// Stable user ID - verified by the gateway before the session exists
    pub user_id: String,

    /// When this session was created
    pub connected_at: Timestamp,
}

/// Authorized identities that can access admin reducers (catalog CRUD,
/// bulk restore). Seeded with the module owner in `init`.
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// Admin-curated blueprint for a solo operation.
/// The engine only reads this table; writes go through the admin reducers.
#[table(name = operation_template, public)]
#[derive(Clone)]
pub struct OperationTemplate {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub title: String,

    pub description: String,

    /// Daily or weekly recurrence
    pub cadence: Cadence,

    /// Which workout metric fills the progress bar
    pub metric: Metric,

    /// Progress needed to complete an instance (positive)
    pub target_value: f32,

    /// XP granted on claim (positive)
    pub xp_reward: u32,

    /// Focus tags, e.g. "strength", "cardio". Assignment prefers templates
    /// sharing a tag with the user's declared focus.
    pub focus: Vec<String>,

    /// JSON map locale -> {title, description}. Opaque here - validated as
    /// JSON at the admin boundary, rendered by the client.
    pub translations: Option<String>,

    /// Retired templates stay for referential integrity but are never
    /// assigned again
    pub is_active: bool,

    pub created_at: Timestamp,
}

/// Admin-curated blueprint for a collective community goal
#[table(name = community_goal_template, public)]
#[derive(Clone)]
pub struct CommunityGoalTemplate {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub title: String,

    pub description: String,

    pub metric: Metric,

    pub target_value: f32,

    /// XP paid to every contributor when the goal completes
    pub xp_reward: u32,

    /// How long a launched goal stays open
    pub duration_days: u32,

    pub is_active: bool,

    pub created_at: Timestamp,
}

/// A launched community goal everyone contributes to.
/// Progress is collective; each user's share is tracked in goal_contribution.
#[table(name = community_goal, public)]
#[derive(Clone)]
pub struct CommunityGoal {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub template_id: u64,

    /// Denormalized for display
    pub title: String,

    pub metric: Metric,

    pub target_value: f32,

    pub xp_reward: u32,

    pub current_progress: f32,

    pub status: GoalStatus,

    pub starts_at: Timestamp,

    pub ends_at: Timestamp,

    pub completed_at: Option<Timestamp>,
}

/// One user's running contribution to a community goal
#[table(name = goal_contribution, public)]
#[derive(Clone)]
pub struct GoalContribution {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// "goal:user" - one row per contributor per goal
    #[unique]
    pub pair_key: String,

    #[index(btree)]
    pub goal_id: u64,

    #[index(btree)]
    pub user_id: String,

    pub amount: f32,

    pub updated_at: Timestamp,
}

/// Per-user assignment of an operation template for one cadence window.
/// Created by assignment, advanced by workout events, finalized by claim.
/// Rows past expires_at are inert and eventually purged by cleanup.
#[table(name = user_operation, public)]
#[derive(Clone)]
pub struct UserOperation {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub user_id: String,

    #[index(btree)]
    pub template_id: u64,

    /// "user:template:window_start_micros". The unique constraint is the
    /// storage-level guarantee that a user holds at most one instance of a
    /// template per cadence window, even if two assignment calls race.
    #[unique]
    pub slot_key: String,

    /// Start of the cadence window this instance belongs to (UTC)
    pub window_start: Timestamp,

    /// Monotonically non-decreasing while unclaimed
    pub current_progress: f32,

    /// Set by the same write that pushes progress past the target
    pub is_completed: bool,

    /// Set exactly once by the claim reducer; the instance is terminal after
    pub claimed_at: Option<Timestamp>,

    /// End of the cadence window
    pub expires_at: Timestamp,

    pub created_at: Timestamp,
}

/// User's aggregate progression state
/// PRIVATE: Clients access via my_progression view for RLS
#[table(name = user_progression)]
#[derive(Clone)]
pub struct UserProgression {
    #[primary_key]
    pub user_id: String,

    /// Cached level, always level_for_xp(cycle_xp)
    pub level: u32,

    /// Lifetime XP - monotonic, never decreases, survives prestige
    pub lifetime_xp: u64,

    /// Cycle XP - the level basis; reset to the head start on ascension
    pub cycle_xp: u64,

    /// Completed ascensions (0-12)
    pub prestige_rank: u32,

    /// Reroll tokens on hand
    pub rerolls_available: u32,

    /// User-declared focus tags, weights template selection
    pub focus: Vec<String>,

    /// UTC day index of the last reroll top-up
    pub last_reroll_day: i64,

    pub created_at: Timestamp,

    pub last_active: Timestamp,
}

/// Schedule table for the assignment/replenish tick
#[table(name = assignment_schedule, scheduled(run_scheduled_assignment))]
pub struct AssignmentSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub scheduled_at: ScheduleAt,
}

/// Schedule table for purging inert rows
#[table(name = cleanup_schedule, scheduled(cleanup_expired_operations))]
pub struct CleanupSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub scheduled_at: ScheduleAt,
}

// ==================== VIEWS ====================

/// View: Returns only the current user's progression row
/// This is the secure way for clients to read their own XP/level/rerolls
#[view(name = my_progression, public)]
fn my_progression(ctx: &spacetimedb::ViewContext) -> Option<UserProgression> {
    let session = ctx.db.session().connection_id().find(ctx.sender)?;
    ctx.db.user_progression().user_id().find(&session.user_id)
}

// ==================== ROW LEVEL SECURITY ====================

/// RLS Filter: Users only see their own operation instances
#[client_visibility_filter]
const USER_OPERATION_VISIBILITY: Filter = Filter::Sql(
    "SELECT op.* FROM user_operation op \
     JOIN session s ON op.user_id = s.user_id \
     WHERE s.connection_id = :sender",
);

// ==================== HELPER FUNCTIONS ====================

/// Get progression from session using the sender's identity
/// This abstracts the session lookup pattern used throughout reducers
fn get_user(ctx: &ReducerContext) -> Result<UserProgression, String> {
    let session = ctx
        .db
        .session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or("No session found".to_string())?;

    ctx.db
        .user_progression()
        .user_id()
        .find(&session.user_id)
        .ok_or("User not found".to_string())
}

/// Reject callers that are not authorized workers (admin surface)
pub(crate) fn ensure_worker(ctx: &ReducerContext) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        return Err("Unauthorized".to_string());
    }
    Ok(())
}

fn to_datetime(ts: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.to_micros_since_unix_epoch())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// `[start, end)` of the cadence window containing `now`, in micros since
/// the Unix epoch. Windows are canonical UTC: daily = one calendar day,
/// weekly = seven days from Monday 00:00. Never user-local - two devices in
/// different timezones must agree on the bucket.
fn window_bounds(cadence: &Cadence, now: Timestamp) -> (i64, i64) {
    let date = to_datetime(now).date_naive();
    match cadence {
        Cadence::Daily => {
            let start = date.and_time(NaiveTime::MIN).and_utc().timestamp_micros();
            (start, start + MICROS_PER_DAY)
        }
        Cadence::Weekly => {
            let monday = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
            let start = monday.and_time(NaiveTime::MIN).and_utc().timestamp_micros();
            (start, start + 7 * MICROS_PER_DAY)
        }
    }
}

/// UTC day index (days since epoch), used to gate daily reroll top-ups
fn utc_day_index(ts: Timestamp) -> i64 {
    ts.to_micros_since_unix_epoch().div_euclid(MICROS_PER_DAY)
}

fn slot_key(user_id: &str, template_id: u64, window_start_micros: i64) -> String {
    format!("{}:{}:{}", user_id, template_id, window_start_micros)
}

fn is_expired(op: &UserOperation, now: Timestamp) -> bool {
    op.expires_at.to_micros_since_unix_epoch() <= now.to_micros_since_unix_epoch()
}

/// The event's delta on one metric channel. A completed session always
/// counts as exactly one workout.
fn metric_delta(metric: &Metric, volume_kg: f32, distance_km: f32, duration_min: f32) -> f32 {
    match metric {
        Metric::Workouts => 1.0,
        Metric::Volume => volume_kg,
        Metric::Distance => distance_km,
        Metric::Duration => duration_min,
    }
}

/// Slot count for a cadence
fn cadence_slots(cadence: &Cadence) -> usize {
    match cadence {
        Cadence::Daily => DAILY_OPERATION_SLOTS,
        Cadence::Weekly => WEEKLY_OPERATION_SLOTS,
    }
}

/// Pick up to `slots` template ids from `candidates`.
///
/// Ids in `recent` (held in the previous window) are skipped when enough
/// alternatives remain, so users don't see the same operation two windows in
/// a row unless the catalog is too small to avoid it. Ids in `preferred`
/// (focus-tag matches) are double-weighted.
fn select_template_ids(
    candidates: Vec<u64>,
    recent: &[u64],
    preferred: &[u64],
    slots: usize,
    rng: &mut impl Rng,
) -> Vec<u64> {
    if slots == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let fresh: Vec<u64> = candidates
        .iter()
        .copied()
        .filter(|id| !recent.contains(id))
        .collect();
    let pool = if fresh.len() >= slots { fresh } else { candidates };

    // Weighted sampling without replacement: preferred ids appear twice
    let mut weighted: Vec<u64> = Vec::with_capacity(pool.len() * 2);
    for id in &pool {
        weighted.push(*id);
        if preferred.contains(id) {
            weighted.push(*id);
        }
    }

    let mut picked = Vec::with_capacity(slots);
    while picked.len() < slots && !weighted.is_empty() {
        let id = weighted[rng.gen_range(0..weighted.len())];
        picked.push(id);
        weighted.retain(|other| *other != id);
    }
    picked
}

/// Template ids the user holds in the current window of a cadence. Claimed
/// instances still occupy their slot until the window rolls over, otherwise
/// claiming would immediately re-open the slot for reassignment.
fn held_template_ids(ctx: &ReducerContext, user_id: &str, cadence: &Cadence, now: Timestamp) -> Vec<u64> {
    let mut held = Vec::new();
    for op in ctx.db.user_operation().user_id().filter(&user_id.to_string()) {
        if is_expired(&op, now) {
            continue;
        }
        let Some(template) = ctx.db.operation_template().id().find(&op.template_id) else {
            // Instance without a template should be impossible (admin deletes
            // are refused while instances exist)
            log::error!(
                "[INVARIANT] orphan instance op:{} template:{} user:{}",
                op.id,
                op.template_id,
                user_id
            );
            continue;
        };
        if template.cadence == *cadence {
            held.push(op.template_id);
        }
    }
    held
}

/// Idempotent assignment for one user and one cadence window.
/// Returns the number of instances created (0 when the user is already full
/// or the catalog has nothing to offer - neither is an error).
fn ensure_cadence_operations(
    ctx: &ReducerContext,
    user: &UserProgression,
    cadence: &Cadence,
    now: Timestamp,
) -> u32 {
    let (win_start, win_end) = window_bounds(cadence, now);
    let slots = cadence_slots(cadence);

    let held = held_template_ids(ctx, &user.user_id, cadence, now);
    if held.len() >= slots {
        return 0;
    }

    let mut candidates = Vec::new();
    let mut preferred = Vec::new();
    for template in ctx.db.operation_template().iter() {
        if !template.is_active || template.cadence != *cadence || held.contains(&template.id) {
            continue;
        }
        if template.focus.iter().any(|tag| user.focus.contains(tag)) {
            preferred.push(template.id);
        }
        candidates.push(template.id);
    }
    if candidates.is_empty() {
        return 0;
    }

    // Templates held in the immediately preceding window, for repeat avoidance
    let prev_start = win_start - (win_end - win_start);
    let recent: Vec<u64> = ctx
        .db
        .user_operation()
        .user_id()
        .filter(&user.user_id)
        .filter(|op| op.window_start.to_micros_since_unix_epoch() == prev_start)
        .map(|op| op.template_id)
        .collect();

    let open = slots - held.len();
    let mut rng = ctx.rng();
    let picked = select_template_ids(candidates, &recent, &preferred, open, &mut rng);

    let mut created = 0u32;
    for template_id in picked {
        let key = slot_key(&user.user_id, template_id, win_start);
        // The unique slot_key is the real duplicate guard; this lookup keeps
        // a concurrent re-assignment from aborting the whole transaction.
        if ctx.db.user_operation().slot_key().find(&key).is_some() {
            continue;
        }
        ctx.db.user_operation().insert(UserOperation {
            id: 0, // auto_inc
            user_id: user.user_id.clone(),
            template_id,
            slot_key: key,
            window_start: Timestamp::from_micros_since_unix_epoch(win_start),
            current_progress: 0.0,
            is_completed: false,
            claimed_at: None,
            expires_at: Timestamp::from_micros_since_unix_epoch(win_end),
            created_at: ctx.timestamp,
        });
        created += 1;
    }
    created
}

/// Grant XP to a progression row and recompute the cached level.
/// Lifetime XP only ever grows; cycle XP drives the level.
fn grant_xp(ctx: &ReducerContext, mut user: UserProgression, xp: u64) -> UserProgression {
    user.lifetime_xp = user.lifetime_xp.saturating_add(xp);
    user.cycle_xp = user.cycle_xp.saturating_add(xp);
    user.level = level_for_xp(user.cycle_xp);
    ctx.db.user_progression().user_id().update(user.clone());
    user
}

// ==================== REDUCERS ====================

/// Create a verified session for a client identity
/// This is called by the gateway AFTER verifying the user's auth token
/// Only authorized workers can call this
#[reducer]
pub fn create_session(ctx: &ReducerContext, client_identity: String, user_id: String) -> Result<(), String> {
    ensure_worker(ctx)?;

    let identity = Identity::from_hex(&client_identity)
        .map_err(|_| "Invalid identity hex string".to_string())?;

    // Delete stale sessions: same user (unclean reconnect) OR same
    // connection_id (prevents PK conflict)
    let stale: Vec<_> = ctx
        .db
        .session()
        .iter()
        .filter(|s| s.user_id == user_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale {
        ctx.db.session().connection_id().delete(&conn_id);
    }

    ctx.db.session().insert(Session {
        connection_id: identity,
        user_id: user_id.clone(),
        connected_at: ctx.timestamp,
    });

    log::info!(
        "[SESSION] created user:{} ws:{}",
        &user_id[..8.min(user_id.len())],
        &client_identity[..8.min(client_identity.len())]
    );
    Ok(())
}

/// User connects. Creates the progression row on first contact (signup
/// defaults) and runs idempotent assignment so the client always lands on a
/// filled operations board.
#[reducer]
pub fn connect(ctx: &ReducerContext) -> Result<(), String> {
    let session = ctx
        .db
        .session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or("Session not found - verify with gateway first".to_string())?;
    let user_id = session.user_id.clone();

    let user = if let Some(mut existing) = ctx.db.user_progression().user_id().find(&user_id) {
        existing.last_active = ctx.timestamp;
        ctx.db.user_progression().user_id().update(existing.clone());
        existing
    } else {
        let fresh = UserProgression {
            user_id: user_id.clone(),
            level: 1,
            lifetime_xp: 0,
            cycle_xp: 0,
            prestige_rank: 0,
            rerolls_available: DAILY_REROLL_ALLOWANCE,
            focus: Vec::new(),
            last_reroll_day: utc_day_index(ctx.timestamp),
            created_at: ctx.timestamp,
            last_active: ctx.timestamp,
        };
        ctx.db.user_progression().insert(fresh.clone());
        log::info!("[CONNECT] user:{} type=new", &user_id[..8.min(user_id.len())]);
        fresh
    };

    let created = ensure_cadence_operations(ctx, &user, &Cadence::Daily, ctx.timestamp)
        + ensure_cadence_operations(ctx, &user, &Cadence::Weekly, ctx.timestamp);

    // Wide event: one canonical log with full progression context
    log::info!(
        "[CONNECT] user:{} level:{} prestige:{} rerolls:{} assigned:{}",
        &user_id[..8.min(user_id.len())],
        user.level,
        user.prestige_rank,
        user.rerolls_available,
        created
    );
    Ok(())
}

/// Clean up the session row when the socket drops
#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    if ctx.db.session().connection_id().find(&ctx.sender).is_some() {
        ctx.db.session().connection_id().delete(&ctx.sender);
        log::debug!("[SESSION] closed ws:{}", ctx.sender);
    }
}

/// Declare focus tags. Self-service - only affects the caller's own
/// assignment weighting.
#[reducer]
pub fn set_focus(ctx: &ReducerContext, focus: Vec<String>) -> Result<(), String> {
    if focus.len() > 8 {
        return Err("INVALID_FOCUS: too many focus tags".to_string());
    }
    let mut user = get_user(ctx)?;
    user.focus = focus;
    ctx.db.user_progression().user_id().update(user);
    Ok(())
}

/// Idempotent daily/weekly assignment for the calling user.
///
/// Safe to call on every app foreground and from the scheduled tick: already
/// holding a full board is success, not an error, and the unique slot key
/// makes racing calls from two devices converge on the same instance set.
#[reducer]
pub fn assign_daily_operations(ctx: &ReducerContext) -> Result<(), String> {
    let user = get_user(ctx)?;

    let created = ensure_cadence_operations(ctx, &user, &Cadence::Daily, ctx.timestamp)
        + ensure_cadence_operations(ctx, &user, &Cadence::Weekly, ctx.timestamp);

    if created > 0 {
        log::info!(
            "[ASSIGN] user:{} created:{}",
            &user.user_id[..8.min(user.user_id.len())],
            created
        );
    }
    Ok(())
}

/// Workout-completion event: the progress accumulator.
///
/// Applies the session's metric deltas to every active, unclaimed instance
/// whose template matches a channel, contributes to active community goals,
/// and grants session XP - all in this one transaction. Expired or claimed
/// instances silently ignore the event.
#[reducer]
pub fn record_workout(
    ctx: &ReducerContext,
    volume_kg: f32,
    distance_km: f32,
    duration_min: f32,
) -> Result<(), String> {
    if !(volume_kg.is_finite() && distance_km.is_finite() && duration_min.is_finite())
        || volume_kg < 0.0
        || distance_km < 0.0
        || duration_min < 0.0
    {
        return Err("INVALID_METRICS: metric deltas must be finite and non-negative".to_string());
    }

    let user = get_user(ctx)?;
    let now = ctx.timestamp;

    // Session XP (separate from operation rewards, which only claim grants)
    let earned = session_xp(volume_kg, distance_km, duration_min);
    let user = grant_xp(ctx, user, u64::from(earned));

    // Advance matching operation instances
    let ops: Vec<UserOperation> = ctx
        .db
        .user_operation()
        .user_id()
        .filter(&user.user_id)
        .collect();
    let mut advanced = 0u32;
    let mut completed = 0u32;
    for mut op in ops {
        if op.claimed_at.is_some() || is_expired(&op, now) {
            continue;
        }
        let Some(template) = ctx.db.operation_template().id().find(&op.template_id) else {
            log::error!("[INVARIANT] orphan instance op:{} template:{}", op.id, op.template_id);
            continue;
        };
        let delta = metric_delta(&template.metric, volume_kg, distance_km, duration_min);
        if delta <= 0.0 {
            continue;
        }
        op.current_progress += delta;
        if !op.is_completed && op.current_progress >= template.target_value {
            op.is_completed = true;
            completed += 1;
        }
        advanced += 1;
        ctx.db.user_operation().id().update(op);
    }

    // Contribute to active community goals
    let goals: Vec<CommunityGoal> = ctx
        .db
        .community_goal()
        .iter()
        .filter(|g| g.status == GoalStatus::Active)
        .collect();
    for mut goal in goals {
        if goal.ends_at.to_micros_since_unix_epoch() <= now.to_micros_since_unix_epoch() {
            continue; // the cleanup tick will mark it expired
        }
        let delta = metric_delta(&goal.metric, volume_kg, distance_km, duration_min);
        if delta <= 0.0 {
            continue;
        }
        goal.current_progress += delta;
        record_contribution(ctx, goal.id, &user.user_id, delta);

        if goal.current_progress >= goal.target_value {
            goal.status = GoalStatus::Completed;
            goal.completed_at = Some(now);
            ctx.db.community_goal().id().update(goal.clone());
            payout_goal(ctx, &goal);
        } else {
            ctx.db.community_goal().id().update(goal);
        }
    }

    // Wide event: one canonical log per workout
    log::info!(
        "[WORKOUT] user:{} xp:{} ops_advanced:{} ops_completed:{} vol:{:.0} dist:{:.1} dur:{:.0}",
        &user.user_id[..8.min(user.user_id.len())],
        earned,
        advanced,
        completed,
        volume_kg,
        distance_km,
        duration_min
    );
    Ok(())
}

/// Upsert the caller's running contribution to a goal
fn record_contribution(ctx: &ReducerContext, goal_id: u64, user_id: &str, delta: f32) {
    let key = format!("{}:{}", goal_id, user_id);
    if let Some(mut existing) = ctx.db.goal_contribution().pair_key().find(&key) {
        existing.amount += delta;
        existing.updated_at = ctx.timestamp;
        ctx.db.goal_contribution().id().update(existing);
    } else {
        ctx.db.goal_contribution().insert(GoalContribution {
            id: 0, // auto_inc
            pair_key: key,
            goal_id,
            user_id: user_id.to_string(),
            amount: delta,
            updated_at: ctx.timestamp,
        });
    }
}

/// Pay a completed goal's reward to every contributor, atomically with the
/// completion itself
fn payout_goal(ctx: &ReducerContext, goal: &CommunityGoal) {
    let mut paid = 0u32;
    let contributors: Vec<String> = ctx
        .db
        .goal_contribution()
        .goal_id()
        .filter(&goal.id)
        .map(|c| c.user_id)
        .collect();
    for user_id in contributors {
        let Some(user) = ctx.db.user_progression().user_id().find(&user_id) else {
            log::warn!("[GOAL] contributor without progression goal:{} user:{}", goal.id, user_id);
            continue;
        };
        grant_xp(ctx, user, u64::from(goal.xp_reward));
        paid += 1;
    }
    log::info!(
        "[GOAL] completed goal:{} \"{}\" contributors:{} reward:{}",
        goal.id,
        goal.title,
        paid,
        goal.xp_reward
    );
}

/// Claim a completed operation's reward - exactly once.
///
/// All preconditions are checked inside this transaction; reducers are
/// serialized, so of N racing claims exactly one sees claimed_at unset and
/// the rest get ALREADY_CLAIMED. The claim mark and the XP grant commit
/// together or not at all.
#[reducer]
pub fn claim_operation_reward(ctx: &ReducerContext, operation_id: u64) -> Result<(), String> {
    let user = get_user(ctx)?;

    let mut op = ctx
        .db
        .user_operation()
        .id()
        .find(&operation_id)
        .ok_or("NOT_FOUND: no such operation".to_string())?;
    if op.user_id != user.user_id {
        // Don't leak other users' instance ids
        return Err("NOT_FOUND: no such operation".to_string());
    }
    if op.claimed_at.is_some() {
        return Err("ALREADY_CLAIMED: this reward was already collected".to_string());
    }
    if is_expired(&op, ctx.timestamp) {
        return Err("EXPIRED: this operation's window has ended".to_string());
    }
    if !op.is_completed {
        return Err("NOT_COMPLETED: the target has not been reached yet".to_string());
    }

    let template = match ctx.db.operation_template().id().find(&op.template_id) {
        Some(t) => t,
        None => {
            log::error!("[INVARIANT] claim on orphan instance op:{} template:{}", op.id, op.template_id);
            return Err("INTERNAL: operation template missing".to_string());
        }
    };

    op.claimed_at = Some(ctx.timestamp);
    ctx.db.user_operation().id().update(op);

    let user = grant_xp(ctx, user, u64::from(template.xp_reward));

    log::info!(
        "[CLAIM] user:{} op:{} \"{}\" xp:{} level:{}",
        &user.user_id[..8.min(user.user_id.len())],
        operation_id,
        template.title,
        template.xp_reward,
        user.level
    );
    Ok(())
}

/// Spend a reroll token to swap an active, incomplete operation for a fresh
/// template in the same window.
///
/// Token decrement, old-instance removal and replacement insert are one
/// transaction - an error at any precondition leaves everything untouched.
#[reducer]
pub fn reroll_operation(ctx: &ReducerContext, operation_id: u64) -> Result<(), String> {
    let mut user = get_user(ctx)?;

    let op = ctx
        .db
        .user_operation()
        .id()
        .find(&operation_id)
        .ok_or("NOT_FOUND: no such operation".to_string())?;
    if op.user_id != user.user_id {
        return Err("NOT_FOUND: no such operation".to_string());
    }
    if op.claimed_at.is_some() || op.is_completed {
        // Protects earned-but-unclaimed progress from being discarded
        return Err("CANNOT_REROLL_COMPLETED: completed operations cannot be rerolled".to_string());
    }
    if is_expired(&op, ctx.timestamp) {
        return Err("EXPIRED: this operation's window has ended".to_string());
    }

    let template = match ctx.db.operation_template().id().find(&op.template_id) {
        Some(t) => t,
        None => {
            log::error!("[INVARIANT] reroll on orphan instance op:{} template:{}", op.id, op.template_id);
            return Err("INTERNAL: operation template missing".to_string());
        }
    };
    if template.cadence == Cadence::Weekly && !WEEKLY_REROLL_ENABLED {
        return Err("REROLL_DISABLED_FOR_CADENCE: weekly operations cannot be rerolled".to_string());
    }
    if user.rerolls_available == 0 {
        return Err("NO_REROLLS_AVAILABLE: no reroll tokens left today".to_string());
    }

    // A replacement must differ from the rerolled template and from every
    // template the user currently holds for this cadence
    let held = held_template_ids(ctx, &user.user_id, &template.cadence, ctx.timestamp);
    let candidates: Vec<u64> = ctx
        .db
        .operation_template()
        .iter()
        .filter(|t| {
            t.is_active && t.cadence == template.cadence && t.id != op.template_id && !held.contains(&t.id)
        })
        .map(|t| t.id)
        .collect();
    if candidates.is_empty() {
        return Err("NO_REPLACEMENT_AVAILABLE: the catalog has no alternative operation".to_string());
    }

    let mut rng = ctx.rng();
    let replacement_id = candidates[rng.gen_range(0..candidates.len())];

    let window_start = op.window_start.to_micros_since_unix_epoch();
    ctx.db.user_operation().id().delete(&op.id);
    ctx.db.user_operation().insert(UserOperation {
        id: 0, // auto_inc
        user_id: user.user_id.clone(),
        template_id: replacement_id,
        slot_key: slot_key(&user.user_id, replacement_id, window_start),
        window_start: op.window_start,
        current_progress: 0.0,
        is_completed: false,
        claimed_at: None,
        expires_at: op.expires_at, // same window boundary as the old instance
        created_at: ctx.timestamp,
    });

    user.rerolls_available -= 1;
    ctx.db.user_progression().user_id().update(user.clone());

    log::info!(
        "[REROLL] user:{} op:{} template:{}→{} tokens_left:{}",
        &user.user_id[..8.min(user.user_id.len())],
        operation_id,
        op.template_id,
        replacement_id,
        user.rerolls_available
    );
    Ok(())
}

/// Ascend: reset the level cycle, keep a head start, earn a prestige rank.
///
/// Eligibility is recomputed from cycle XP here - the cached level column is
/// never trusted for this decision. Lifetime XP is untouched.
#[reducer]
pub fn ascend(ctx: &ReducerContext) -> Result<(), String> {
    let mut user = get_user(ctx)?;

    let level = level_for_xp(user.cycle_xp);
    if level < progression::PRESTIGE_LEVEL {
        return Err(format!(
            "NOT_ELIGIBLE_FOR_ASCENSION: level {} required, currently {}",
            progression::PRESTIGE_LEVEL,
            level
        ));
    }
    if user.prestige_rank >= progression::MAX_PRESTIGE_RANK {
        return Err("NOT_ELIGIBLE_FOR_ASCENSION: maximum prestige rank reached".to_string());
    }

    let before = user.cycle_xp;
    let head_start = head_start_xp(before, user.prestige_rank);

    user.cycle_xp = head_start;
    user.level = level_for_xp(head_start);
    user.prestige_rank += 1;
    ctx.db.user_progression().user_id().update(user.clone());

    log::info!(
        "[PRESTIGE] user:{} rank:{} \"{}\" xp:{}→{} level:{}",
        &user.user_id[..8.min(user.user_id.len())],
        user.prestige_rank,
        prestige_title(user.prestige_rank),
        before,
        head_start,
        user.level
    );
    Ok(())
}

// ==================== SCHEDULED REDUCERS ====================

/// Hourly tick: top up reroll tokens on UTC day change and keep every user's
/// operation board filled. Both halves are idempotent, so overlapping with
/// live client calls is harmless.
#[reducer]
pub fn run_scheduled_assignment(ctx: &ReducerContext, _schedule: AssignmentSchedule) {
    let today = utc_day_index(ctx.timestamp);
    let users: Vec<UserProgression> = ctx.db.user_progression().iter().collect();

    let mut replenished = 0u32;
    let mut assigned = 0u32;
    for mut user in users {
        if user.last_reroll_day < today {
            user.rerolls_available = user.rerolls_available.max(DAILY_REROLL_ALLOWANCE);
            user.last_reroll_day = today;
            ctx.db.user_progression().user_id().update(user.clone());
            replenished += 1;
        }
        assigned += ensure_cadence_operations(ctx, &user, &Cadence::Daily, ctx.timestamp);
        assigned += ensure_cadence_operations(ctx, &user, &Cadence::Weekly, ctx.timestamp);
    }

    if replenished > 0 || assigned > 0 {
        log::info!("[ASSIGN] tick replenished:{} created:{}", replenished, assigned);
    }
}

/// Purge inert rows: long-expired instances and finished community goals.
/// Active goals past their end are flipped to Expired first so clients stop
/// contributing to them.
#[reducer]
pub fn cleanup_expired_operations(ctx: &ReducerContext, _schedule: CleanupSchedule) {
    let now_micros = ctx.timestamp.to_micros_since_unix_epoch();
    let cutoff = now_micros - RETENTION_DAYS * MICROS_PER_DAY;

    let stale_ops: Vec<u64> = ctx
        .db
        .user_operation()
        .iter()
        .filter(|op| op.expires_at.to_micros_since_unix_epoch() < cutoff)
        .map(|op| op.id)
        .collect();
    for id in &stale_ops {
        ctx.db.user_operation().id().delete(id);
    }

    let mut expired_goals = 0u32;
    let mut purged_goals = 0u32;
    let goals: Vec<CommunityGoal> = ctx.db.community_goal().iter().collect();
    for mut goal in goals {
        let ended = goal.ends_at.to_micros_since_unix_epoch();
        if goal.status == GoalStatus::Active && ended <= now_micros {
            goal.status = GoalStatus::Expired;
            ctx.db.community_goal().id().update(goal);
            expired_goals += 1;
        } else if goal.status != GoalStatus::Active && ended < cutoff {
            let contributions: Vec<u64> = ctx
                .db
                .goal_contribution()
                .goal_id()
                .filter(&goal.id)
                .map(|c| c.id)
                .collect();
            for id in contributions {
                ctx.db.goal_contribution().id().delete(&id);
            }
            ctx.db.community_goal().id().delete(&goal.id);
            purged_goals += 1;
        }
    }

    if !stale_ops.is_empty() || expired_goals > 0 || purged_goals > 0 {
        log::info!(
            "[CLEANUP] ops_purged:{} goals_expired:{} goals_purged:{}",
            stale_ops.len(),
            expired_goals,
            purged_goals
        );
    }
}

// ==================== INIT ====================

#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // Module owner becomes an authorized worker for admin reducer access
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    // Check if schedulers already exist to avoid duplicates on hot-reload
    if ctx.db.assignment_schedule().iter().count() == 0 {
        ctx.db.assignment_schedule().insert(AssignmentSchedule {
            id: 0, // auto_inc
            scheduled_at: ScheduleAt::Interval(
                std::time::Duration::from_secs(ASSIGNMENT_TICK_SECS).into(),
            ),
        });
    }
    if ctx.db.cleanup_schedule().iter().count() == 0 {
        ctx.db.cleanup_schedule().insert(CleanupSchedule {
            id: 0, // auto_inc
            scheduled_at: ScheduleAt::Interval(
                std::time::Duration::from_secs(CLEANUP_TICK_SECS).into(),
            ),
        });
    }

    log::info!("IronCircle operations module initialized successfully");
}

// ==================== TESTS ====================

#[cfg(test)]
mod tests {
    use super::*;
    use spacetimedb::rand::{rngs::StdRng, SeedableRng};

    // 2024-01-10 (a Wednesday), as a day index since the Unix epoch
    const WEDNESDAY_DAY_INDEX: i64 = 19_732;

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros_since_unix_epoch(micros)
    }

    #[test]
    fn daily_window_is_the_utc_calendar_day() {
        let midday = WEDNESDAY_DAY_INDEX * MICROS_PER_DAY + 15 * 3_600 * 1_000_000;
        let (start, end) = window_bounds(&Cadence::Daily, ts(midday));
        assert_eq!(start, WEDNESDAY_DAY_INDEX * MICROS_PER_DAY);
        assert_eq!(end, (WEDNESDAY_DAY_INDEX + 1) * MICROS_PER_DAY);
    }

    #[test]
    fn daily_window_boundaries() {
        let midnight = WEDNESDAY_DAY_INDEX * MICROS_PER_DAY;
        let (start, _) = window_bounds(&Cadence::Daily, ts(midnight));
        assert_eq!(start, midnight, "midnight belongs to its own day");

        let last_micro = midnight - 1;
        let (prev_start, prev_end) = window_bounds(&Cadence::Daily, ts(last_micro));
        assert_eq!(prev_start, midnight - MICROS_PER_DAY);
        assert_eq!(prev_end, midnight, "end of one window is start of the next");
    }

    #[test]
    fn weekly_window_starts_monday() {
        // Wednesday 2024-01-10 -> Monday 2024-01-08
        let midday = WEDNESDAY_DAY_INDEX * MICROS_PER_DAY + 12 * 3_600 * 1_000_000;
        let (start, end) = window_bounds(&Cadence::Weekly, ts(midday));
        assert_eq!(start, (WEDNESDAY_DAY_INDEX - 2) * MICROS_PER_DAY);
        assert_eq!(end - start, 7 * MICROS_PER_DAY);

        // The following Sunday still falls in the same week
        let sunday = (WEDNESDAY_DAY_INDEX + 4) * MICROS_PER_DAY + 1;
        let (sunday_start, _) = window_bounds(&Cadence::Weekly, ts(sunday));
        assert_eq!(sunday_start, start);

        // The next Monday starts a new week
        let next_monday = (WEDNESDAY_DAY_INDEX + 5) * MICROS_PER_DAY;
        let (next_start, _) = window_bounds(&Cadence::Weekly, ts(next_monday));
        assert_eq!(next_start, start + 7 * MICROS_PER_DAY);
    }

    #[test]
    fn day_index_handles_boundaries() {
        assert_eq!(utc_day_index(ts(0)), 0);
        assert_eq!(utc_day_index(ts(MICROS_PER_DAY - 1)), 0);
        assert_eq!(utc_day_index(ts(MICROS_PER_DAY)), 1);
    }

    #[test]
    fn slot_keys_separate_users_templates_and_windows() {
        let a = slot_key("user-a", 7, 1_000);
        assert_eq!(a, "user-a:7:1000");
        assert_ne!(a, slot_key("user-b", 7, 1_000));
        assert_ne!(a, slot_key("user-a", 8, 1_000));
        assert_ne!(a, slot_key("user-a", 7, 2_000));
    }

    #[test]
    fn selection_fills_slots_without_duplicates() {
        let mut rng = StdRng::seed_from_u64(42);
        let picked = select_template_ids(vec![1, 2, 3, 4, 5], &[], &[], 3, &mut rng);
        assert_eq!(picked.len(), 3);
        let mut unique = picked.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3, "no template picked twice");
    }

    #[test]
    fn selection_returns_everything_when_catalog_is_small() {
        let mut rng = StdRng::seed_from_u64(7);
        let picked = select_template_ids(vec![10, 20], &[], &[], 3, &mut rng);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn selection_avoids_previous_window_when_it_can() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let picked = select_template_ids(vec![1, 2, 3, 4, 5, 6], &[1, 2, 3], &[], 3, &mut rng);
            assert_eq!(picked.len(), 3);
            assert!(
                picked.iter().all(|id| ![1, 2, 3].contains(id)),
                "repeat from previous window despite fresh alternatives: {:?}",
                picked
            );
        }
    }

    #[test]
    fn selection_falls_back_to_repeats_when_catalog_is_tight() {
        // Only 3 candidates for 3 slots: recent exclusion must yield, not starve
        let mut rng = StdRng::seed_from_u64(3);
        let picked = select_template_ids(vec![1, 2, 3], &[1, 2], &[], 3, &mut rng);
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn selection_prefers_focus_matches() {
        // With double weighting, template 1 should show up in roughly two
        // thirds of single-slot draws from a two-template pool
        let mut rng = StdRng::seed_from_u64(99);
        let mut hits = 0;
        for _ in 0..1_000 {
            let picked = select_template_ids(vec![1, 2], &[], &[1], 1, &mut rng);
            if picked == [1] {
                hits += 1;
            }
        }
        assert!((550..=790).contains(&hits), "expected ~2/3 preference, got {}", hits);
    }

    #[test]
    fn selection_handles_empty_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(select_template_ids(vec![], &[], &[], 3, &mut rng).is_empty());
        assert!(select_template_ids(vec![1, 2], &[], &[], 0, &mut rng).is_empty());
    }

    #[test]
    fn metric_deltas_route_channels() {
        assert_eq!(metric_delta(&Metric::Workouts, 500.0, 5.0, 60.0), 1.0);
        assert_eq!(metric_delta(&Metric::Volume, 500.0, 5.0, 60.0), 500.0);
        assert_eq!(metric_delta(&Metric::Distance, 500.0, 5.0, 60.0), 5.0);
        assert_eq!(metric_delta(&Metric::Duration, 500.0, 5.0, 60.0), 60.0);
    }

    #[test]
    fn cadence_slot_configuration() {
        assert_eq!(cadence_slots(&Cadence::Daily), 3);
        assert_eq!(cadence_slots(&Cadence::Weekly), 1);
    }
}
