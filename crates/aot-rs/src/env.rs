use std::env;
use std::sync::OnceLock;

static AOTRS_PASS_STATS: OnceLock<bool> = OnceLock::new();
static AOTRS_DUMP_IR: OnceLock<bool> = OnceLock::new();
static AOTRS_PROFILE: OnceLock<bool> = OnceLock::new();
static AOTRS_MAX_OPERANDS: OnceLock<Option<usize>> = OnceLock::new();

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Reads a boolean switch, falling back to `default` when unset or blank.
pub fn read_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => default,
    }
}

pub fn pass_stats_enabled() -> bool {
    *AOTRS_PASS_STATS.get_or_init(|| read_flag("AOTRS_PASS_STATS", false))
}

pub fn dump_ir_enabled() -> bool {
    *AOTRS_DUMP_IR.get_or_init(|| read_flag("AOTRS_DUMP_IR", false))
}

pub fn profile_enabled() -> bool {
    *AOTRS_PROFILE.get_or_init(|| read_flag("AOTRS_PROFILE", false))
}

/// Operand-count limit override. Values below two are ignored.
pub fn max_operands_override() -> Option<usize> {
    *AOTRS_MAX_OPERANDS.get_or_init(|| {
        env::var("AOTRS_MAX_OPERANDS")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|limit| *limit >= 2)
    })
}
