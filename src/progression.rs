// Leveling, prestige and session XP policy.
// Every XP curve lives here exactly once - the claim and prestige reducers
// both call into this module so the two can never disagree.

// ==================== CONSTANTS ====================

/// XP needed to go from level 1 to level 2
const FIRST_STEP_XP: u64 = 500;

/// Each level-up requirement grows by this much
const STEP_GROWTH_XP: u64 = 100;

/// Hard level cap - the curve stops here no matter how much XP accrues
pub const LEVEL_CAP: u32 = 1000;

/// Level at which a user becomes eligible to ascend (prestige)
pub const PRESTIGE_LEVEL: u32 = 100;

/// Maximum prestige rank ("APEX") - ascension is refused past this
pub const MAX_PRESTIGE_RANK: u32 = 12;

/// Cycle XP required to hit level 100 exactly.
/// Sum of the arithmetic series: 99 steps starting at 500 growing by 100.
pub const XP_TO_LEVEL_100: u64 = 534_600;

/// Head start keeps this base percentage of pre-ascension cycle XP...
const HEAD_START_BASE_PERCENT: u64 = 25;

/// ...plus one percent per prestige rank already earned, up to this
const HEAD_START_MAX_PERCENT: u64 = 40;

/// Head start can never restore past this level, regardless of percentage
const HEAD_START_LEVEL_CEILING: u32 = 70;

// Session XP (workout-completion award, separate from operation rewards).
// The caps are anti-cheat limits carried over from production tuning.

/// Flat award for finishing any workout session
const SESSION_BASE_XP: u32 = 100;

/// Volume above this (kg) is ignored when computing the volume bonus
const SESSION_VOLUME_CAP_KG: f32 = 100_000.0;

/// Ceiling on the volume bonus alone
const SESSION_VOLUME_XP_CAP: u32 = 2_000;

/// Ceiling on the combined cardio (distance + duration) bonus
const SESSION_CARDIO_XP_CAP: u32 = 1_500;

/// Ceiling on the whole session award
const SESSION_TOTAL_XP_CAP: u32 = 5_000;

// ==================== LEVELING CURVE ====================

/// Level for a given cycle XP total.
///
/// Arithmetic-progression curve:
///   L1 -> 0 XP
///   L2 -> 500 XP       (step 500)
///   L3 -> 1,100 XP     (step 600)
///   L4 -> 1,800 XP     (step 700)
///   ...
///   L100 -> 534,600 XP
///
/// Monotonic, deterministic, hard-capped at LEVEL_CAP.
pub fn level_for_xp(xp: u64) -> u32 {
    let mut level = 1u32;
    let mut step = FIRST_STEP_XP;
    let mut accumulated = 0u64;

    while xp >= accumulated + step {
        accumulated += step;
        level += 1;
        step += STEP_GROWTH_XP;

        if level >= LEVEL_CAP {
            return LEVEL_CAP;
        }
    }

    level
}

/// Total cycle XP required to reach a level (inverse of the curve).
pub fn xp_for_level(level: u32) -> u64 {
    if level <= 1 {
        return 0;
    }
    let steps = (level.min(LEVEL_CAP) - 1) as u64;
    // Sum of `steps` terms: FIRST_STEP, FIRST_STEP + GROWTH, ...
    steps * FIRST_STEP_XP + STEP_GROWTH_XP * (steps * (steps - 1) / 2)
}

// ==================== PRESTIGE ====================

/// Head-start cycle XP credited by a successful ascension.
///
/// Keeps a rank-scaled fraction of the pre-ascension cycle XP, capped so the
/// restored level never exceeds HEAD_START_LEVEL_CEILING and the result never
/// exceeds what the user actually had (no inflation). A user ascending at
/// exactly the level-100 threshold lands in the high 40s.
pub fn head_start_xp(cycle_xp: u64, prestige_rank: u32) -> u64 {
    let percent = (HEAD_START_BASE_PERCENT + prestige_rank as u64).min(HEAD_START_MAX_PERCENT);
    let kept = cycle_xp / 100 * percent + (cycle_xp % 100) * percent / 100;
    kept.min(xp_for_level(HEAD_START_LEVEL_CEILING)).min(cycle_xp)
}

/// Whether a user at this derived level / rank may ascend
pub fn ascension_eligible(level: u32, prestige_rank: u32) -> bool {
    level >= PRESTIGE_LEVEL && prestige_rank < MAX_PRESTIGE_RANK
}

/// Display title for a prestige rank
pub fn prestige_title(rank: u32) -> &'static str {
    match rank {
        1 => "PROSPECT",
        2 => "HAZARD",
        3 => "UNCHAINED",
        4 => "GRIND",
        5 => "REAPER",
        6 => "BERSERKER",
        7 => "VANGUARD",
        8 => "IMPERATOR",
        9 => "PHANTOM",
        10 => "LEGION",
        11 => "TITAN",
        12 => "APEX",
        _ => "INITIATE",
    }
}

// ==================== SESSION XP ====================

/// Clamp a bonus to its cap while still a float, so the u32 cast always
/// operates on a small in-range value. Inputs can be any finite f32.
fn capped_bonus(raw: f32, cap: u32) -> u32 {
    raw.clamp(0.0, cap as f32) as u32
}

/// XP awarded for a completed workout session, independent of any operation.
///
/// Base award plus capped volume and cardio bonuses. All inputs are the
/// session's aggregated metric deltas; negative values are treated as zero
/// (the reducer validates them before calling, this is a backstop). Every
/// component is clamped to its cap before integer math, so no finite input
/// can overflow.
pub fn session_xp(volume_kg: f32, distance_km: f32, duration_min: f32) -> u32 {
    let mut xp = SESSION_BASE_XP;

    let capped_volume = volume_kg.clamp(0.0, SESSION_VOLUME_CAP_KG);
    xp += capped_bonus(capped_volume * 0.05, SESSION_VOLUME_XP_CAP);

    // 1 km = 100 XP, 1 min = 2 XP, jointly capped
    let cardio_xp = capped_bonus(distance_km * 100.0, SESSION_CARDIO_XP_CAP)
        + capped_bonus(duration_min * 2.0, SESSION_CARDIO_XP_CAP);
    xp += cardio_xp.min(SESSION_CARDIO_XP_CAP);

    xp.min(SESSION_TOTAL_XP_CAP)
}

// ==================== TESTS ====================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_early_levels() {
        // (xp, expected level) straight from the curve table
        let cases = [
            (0u64, 1u32),
            (499, 1),
            (500, 2),
            (1_099, 2),
            (1_100, 3),
            (1_799, 3),
            (1_800, 4),
        ];
        for (xp, expected) in cases {
            assert_eq!(level_for_xp(xp), expected, "xp={}", xp);
        }
    }

    #[test]
    fn curve_hits_level_100_at_documented_threshold() {
        assert_eq!(level_for_xp(XP_TO_LEVEL_100), 100);
        assert_eq!(level_for_xp(XP_TO_LEVEL_100 - 1), 99);
        assert_eq!(xp_for_level(100), XP_TO_LEVEL_100);
    }

    #[test]
    fn curve_is_capped() {
        assert_eq!(level_for_xp(u64::MAX / 2), LEVEL_CAP);
        assert_eq!(xp_for_level(LEVEL_CAP + 50), xp_for_level(LEVEL_CAP));
    }

    #[test]
    fn xp_for_level_inverts_level_for_xp() {
        for level in 1..=200u32 {
            let threshold = xp_for_level(level);
            assert_eq!(level_for_xp(threshold), level, "level={}", level);
            if threshold > 0 {
                assert_eq!(level_for_xp(threshold - 1), level - 1, "level={}", level);
            }
        }
    }

    #[test]
    fn curve_is_monotonic() {
        let mut prev = 0;
        for xp in (0..1_000_000u64).step_by(777) {
            let level = level_for_xp(xp);
            assert!(level >= prev);
            prev = level;
        }
    }

    #[test]
    fn head_start_never_inflates() {
        for rank in 0..MAX_PRESTIGE_RANK {
            for xp in [0u64, 1, 99, 100, 534_600, 1_000_000, 50_349_600] {
                assert!(head_start_xp(xp, rank) <= xp, "xp={} rank={}", xp, rank);
            }
        }
    }

    #[test]
    fn head_start_restores_near_documented_level() {
        // Fresh ascension at exactly the level-100 threshold lands high-40s
        let restored = level_for_xp(head_start_xp(XP_TO_LEVEL_100, 0));
        assert!(
            (45..=55).contains(&restored),
            "restored level {} out of expected band",
            restored
        );
    }

    #[test]
    fn head_start_respects_level_ceiling() {
        // A level-1000 hoarder still restores at most the ceiling level
        let hoard = xp_for_level(LEVEL_CAP);
        for rank in 0..MAX_PRESTIGE_RANK {
            let restored = level_for_xp(head_start_xp(hoard, rank));
            assert!(restored <= 70, "rank={} restored={}", rank, restored);
        }
    }

    #[test]
    fn head_start_scales_with_rank() {
        let base = head_start_xp(100_000, 0);
        let ranked = head_start_xp(100_000, 5);
        assert!(ranked > base);
        // Percentage is capped, so very high ranks converge
        assert_eq!(head_start_xp(100_000, 15), head_start_xp(100_000, 20));
    }

    #[test]
    fn eligibility_gates() {
        assert!(!ascension_eligible(99, 0));
        assert!(ascension_eligible(100, 0));
        assert!(ascension_eligible(100, MAX_PRESTIGE_RANK - 1));
        assert!(!ascension_eligible(100, MAX_PRESTIGE_RANK));
        assert!(ascension_eligible(LEVEL_CAP, 3));
    }

    #[test]
    fn prestige_titles() {
        assert_eq!(prestige_title(0), "INITIATE");
        assert_eq!(prestige_title(1), "PROSPECT");
        assert_eq!(prestige_title(12), "APEX");
        assert_eq!(prestige_title(99), "INITIATE");
    }

    #[test]
    fn session_xp_base_only() {
        assert_eq!(session_xp(0.0, 0.0, 0.0), 100);
        // Backstop: garbage negative deltas count as zero
        assert_eq!(session_xp(-50.0, -1.0, -10.0), 100);
    }

    #[test]
    fn session_xp_volume_bonus_and_cap() {
        // 10,000 kg -> 500 bonus
        assert_eq!(session_xp(10_000.0, 0.0, 0.0), 600);
        // Volume bonus saturates at 2,000 even for absurd totals
        assert_eq!(session_xp(1_000_000.0, 0.0, 0.0), 2_100);
    }

    #[test]
    fn session_xp_cardio_bonus_and_cap() {
        // 5 km + 30 min -> 500 + 60
        assert_eq!(session_xp(0.0, 5.0, 30.0), 660);
        // Cardio saturates at 1,500
        assert_eq!(session_xp(0.0, 100.0, 0.0), 1_600);
    }

    #[test]
    fn session_xp_total_cap() {
        assert_eq!(session_xp(1_000_000.0, 1_000.0, 1_000.0), 3_600);
        // The 5,000 total cap only binds if component caps are raised,
        // but the invariant must hold regardless
        assert!(session_xp(f32::MAX, f32::MAX, f32::MAX) <= 5_000);
    }

    #[test]
    fn session_xp_tolerates_extreme_finite_inputs() {
        // Huge-but-finite deltas pass the reducer's validation, so the
        // bonus math must clamp rather than overflow. Both cardio channels
        // maxed still land on the joint cardio cap.
        assert_eq!(session_xp(0.0, f32::MAX, f32::MAX), 100 + 1_500);
        assert_eq!(session_xp(f32::MAX, 0.0, 0.0), 100 + 2_000);
        // Overflow-prone products (distance * 100 = infinity) clamp cleanly
        assert_eq!(session_xp(0.0, f32::MAX / 2.0, 0.0), 100 + 1_500);
    }
}
