use std::env;
use std::str::FromStr;

/// How incoming `lots_upsert` entries are merged into existing inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotMergePolicy {
    /// Any collision with an existing lot id is a conflict.
    Reject,
    /// Existing lots may grow: `remaining_quantity` increases only by the
    /// delta in `original_quantity`. Shrinking is a conflict.
    UpsertIncreaseOnly,
}

impl FromStr for LotMergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "upsert_increase_only" => Ok(Self::UpsertIncreaseOnly),
            _ => Err(format!("unknown lot merge policy: {s}")),
        }
    }
}

/// Engine behavior knobs. Tests construct this directly; services read it
/// from the environment via [`Config::from_env`].
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// When true, a sale may not consume lots received after its sale date.
    pub require_date_guard: bool,
    pub lot_merge_policy: LotMergePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            require_date_guard: true,
            lot_merge_policy: LotMergePolicy::UpsertIncreaseOnly,
        }
    }
}

/// Application configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let require_date_guard = match env::var("COGS_REQUIRE_DATE_GUARD") {
            Ok(v) => v
                .parse::<bool>()
                .map_err(|_| "COGS_REQUIRE_DATE_GUARD must be true or false".to_string())?,
            Err(_) => true,
        };

        let lot_merge_policy = match env::var("COGS_LOT_MERGE_POLICY") {
            Ok(v) => v.parse::<LotMergePolicy>()?,
            Err(_) => LotMergePolicy::UpsertIncreaseOnly,
        };

        Ok(Config {
            database_url,
            engine: EngineConfig {
                require_date_guard,
                lot_merge_policy,
            },
        })
    }
}
