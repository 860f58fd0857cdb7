//! # Catalog
//!
//! Static configuration: challenge templates and their difficulty tiers.
//!
//! The catalog is read-only once built and is shared freely across sessions
//! (wrap it in an `Arc`). Every tier is validated at construction time, so
//! lookups never have to re-check table consistency.
//!
//! | Template          | Units/day | Pacing            |
//! |-------------------|-----------|-------------------|
//! | `water`           | 15        | 20 min, 3 / hour  |
//! | `book`            | 1         | none              |
//! | `running`         | 1         | none              |
//! | `instagram-detox` | 1         | none              |
//! | `earlysleep`      | 1         | none              |

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::admission::PacingRule;
use crate::errors::{CatalogError, ValidationError};
use crate::types::Money;

fn default_units_per_day() -> u32 {
    1
}

fn default_stake_step() -> Money {
    100
}

/// A difficulty configuration for a template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultyTier {
    pub id: String,
    pub name: String,
    pub duration_days: u32,
    pub min_stake: Money,
    pub max_stake: Money,
    pub max_bonus: Money,
    pub platform_fee_percent: u8,
    #[serde(default = "default_units_per_day")]
    pub units_per_day: u32,
    /// Stakes are accepted in multiples of this increment.
    #[serde(default = "default_stake_step")]
    pub stake_step: Money,
    #[serde(default)]
    pub proof_required: String,
    /// Human-readable daily target ("3 km", "1h screen time").
    #[serde(default)]
    pub target: Option<String>,
}

/// A challenge kind and its tiers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeTemplate {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub sponsor: Option<String>,
    /// What one unit is called ("glass", "photo").
    pub unit_label: String,
    /// `None` means units are never rate limited.
    #[serde(default)]
    pub pacing: Option<PacingRule>,
    pub tiers: Vec<DifficultyTier>,
}

impl ChallengeTemplate {
    pub fn tier(&self, tier_id: &str) -> Option<&DifficultyTier> {
        self.tiers.iter().find(|t| t.id == tier_id)
    }
}

/// What a user is shown before committing a stake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeQuote {
    pub stake: Money,
    pub max_bonus: Money,
    /// Taken from the stake if it ends up invested after a failure.
    pub platform_fee: Money,
    /// Stake plus maximum bonus on completion.
    pub potential_return: Money,
}

/// Accept `amount` iff it lies in `[min_stake, max_stake]` and is a multiple
/// of the tier's stake step.
pub fn validate_stake(tier: &DifficultyTier, amount: Money) -> Result<(), ValidationError> {
    if amount < tier.min_stake || amount > tier.max_stake {
        return Err(ValidationError::StakeOutOfRange {
            amount,
            min: tier.min_stake,
            max: tier.max_stake,
        });
    }
    if tier.stake_step <= 0 || amount % tier.stake_step != 0 {
        return Err(ValidationError::StakeOffStep {
            amount,
            step: tier.stake_step,
        });
    }
    Ok(())
}

pub fn quote(tier: &DifficultyTier, amount: Money) -> Result<StakeQuote, ValidationError> {
    validate_stake(tier, amount)?;
    let overflow = || ValidationError::QuoteOverflow { amount };
    let platform_fee = amount
        .checked_mul(Money::from(tier.platform_fee_percent))
        .ok_or_else(overflow)?
        / 100;
    let potential_return = amount.checked_add(tier.max_bonus).ok_or_else(overflow)?;
    Ok(StakeQuote {
        stake: amount,
        max_bonus: tier.max_bonus,
        platform_fee,
        potential_return,
    })
}

/// Validated, immutable table of templates keyed by id.
#[derive(Clone, Debug)]
pub struct Catalog {
    templates: BTreeMap<String, ChallengeTemplate>,
}

impl Catalog {
    pub fn from_templates(templates: Vec<ChallengeTemplate>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for template in templates {
            check_template(&template)?;
            if map.contains_key(&template.id) {
                return Err(CatalogError::DuplicateTemplate(template.id));
            }
            map.insert(template.id.clone(), template);
        }
        Ok(Self { templates: map })
    }

    /// Parse a JSON array of templates.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let templates: Vec<ChallengeTemplate> =
            serde_json::from_str(json).map_err(|e| CatalogError::Json(e.to_string()))?;
        Self::from_templates(templates)
    }

    pub fn template(&self, template_id: &str) -> Option<&ChallengeTemplate> {
        self.templates.get(template_id)
    }

    /// Resolve a user's tier selection.
    pub fn resolve(
        &self,
        template_id: &str,
        tier_id: &str,
    ) -> Result<(&ChallengeTemplate, &DifficultyTier), ValidationError> {
        let template = self
            .template(template_id)
            .ok_or_else(|| ValidationError::UnknownTemplate(template_id.to_string()))?;
        let tier = template
            .tier(tier_id)
            .ok_or_else(|| ValidationError::UnknownTier {
                template_id: template_id.to_string(),
                tier_id: tier_id.to_string(),
            })?;
        Ok((template, tier))
    }

    pub fn templates(&self) -> impl Iterator<Item = &ChallengeTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// The product's challenge table.
    pub fn builtin() -> Self {
        Self {
            templates: builtin_templates()
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
        }
    }
}

fn check_template(template: &ChallengeTemplate) -> Result<(), CatalogError> {
    if template.tiers.is_empty() {
        return Err(CatalogError::NoTiers(template.id.clone()));
    }
    if let Some(pacing) = template.pacing {
        if pacing.max_per_hour == 0 {
            return Err(CatalogError::InvalidPacing {
                template_id: template.id.clone(),
                reason: "max_per_hour must be at least 1".to_string(),
            });
        }
    }

    let mut seen = HashSet::new();
    for tier in &template.tiers {
        if !seen.insert(tier.id.as_str()) {
            return Err(CatalogError::DuplicateTier {
                template_id: template.id.clone(),
                tier_id: tier.id.clone(),
            });
        }
        if let Some(reason) = tier_problem(tier) {
            return Err(CatalogError::InvalidTier {
                template_id: template.id.clone(),
                tier_id: tier.id.clone(),
                reason,
            });
        }
    }
    Ok(())
}

/// Largest stake or bonus a catalog may offer.
const MAX_AMOUNT: Money = 1_000_000_000_000;

fn tier_problem(tier: &DifficultyTier) -> Option<String> {
    if tier.duration_days == 0 {
        return Some("duration_days must be positive".to_string());
    }
    if tier.units_per_day == 0 {
        return Some("units_per_day must be at least 1".to_string());
    }
    if tier.stake_step <= 0 {
        return Some("stake_step must be positive".to_string());
    }
    if tier.min_stake <= 0 || tier.min_stake > tier.max_stake {
        return Some(format!(
            "stake bounds [{}, {}] are invalid",
            tier.min_stake, tier.max_stake
        ));
    }
    if tier.min_stake % tier.stake_step != 0 || tier.max_stake % tier.stake_step != 0 {
        return Some(format!(
            "stake bounds must be multiples of {}",
            tier.stake_step
        ));
    }
    if tier.max_stake > MAX_AMOUNT || tier.max_bonus > MAX_AMOUNT {
        return Some(format!("stakes and bonuses must not exceed {MAX_AMOUNT}"));
    }
    if tier.max_bonus < 0 {
        return Some("max_bonus must not be negative".to_string());
    }
    if tier.platform_fee_percent > 100 {
        return Some("platform_fee_percent must be within 0..=100".to_string());
    }
    None
}

// ── Built-in table ───────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn tier(
    id: &str,
    name: &str,
    duration_days: u32,
    (min_stake, max_stake): (Money, Money),
    max_bonus: Money,
    platform_fee_percent: u8,
    units_per_day: u32,
    proof_required: &str,
) -> DifficultyTier {
    DifficultyTier {
        id: id.to_string(),
        name: name.to_string(),
        duration_days,
        min_stake,
        max_stake,
        max_bonus,
        platform_fee_percent,
        units_per_day,
        stake_step: 100,
        proof_required: proof_required.to_string(),
        target: None,
    }
}

fn with_target(mut tier: DifficultyTier, target: &str) -> DifficultyTier {
    tier.target = Some(target.to_string());
    tier
}

fn builtin_templates() -> Vec<ChallengeTemplate> {
    const GLASSES: u32 = 15;

    let running = |id: &str, name: &str, days: u32, bonus: Money, km: &str| {
        let mut t = with_target(
            tier(id, name, days, (100, 5000), bonus, 5, 1, "Run tracker screenshot"),
            km,
        );
        t.stake_step = 50;
        t
    };

    vec![
        ChallengeTemplate {
            id: "water".to_string(),
            title: "Hydration Challenge".to_string(),
            sponsor: Some("Bisleri".to_string()),
            unit_label: "glass".to_string(),
            pacing: Some(PacingRule {
                min_interval_minutes: 20,
                max_per_hour: 3,
            }),
            tiers: vec![
                with_target(
                    tier("easy", "EASY", 1, (100, 300), 15, 5, GLASSES, "Photo per glass"),
                    "3L daily",
                ),
                with_target(
                    tier("medium", "MEDIUM", 7, (300, 1000), 60, 3, GLASSES, "Photo per glass"),
                    "3L daily",
                ),
                with_target(
                    tier("hard", "HARD", 30, (1000, 5000), 250, 5, GLASSES, "Photo per glass"),
                    "3L daily",
                ),
                with_target(
                    tier("expert", "EXPERT", 90, (2000, 10000), 750, 7, GLASSES, "Photo per glass + AI checks"),
                    "3L daily",
                ),
            ],
        },
        ChallengeTemplate {
            id: "book".to_string(),
            title: "Reading Challenge".to_string(),
            sponsor: Some("Kindle".to_string()),
            unit_label: "photo".to_string(),
            pacing: None,
            tiers: vec![
                tier("easy", "EASY", 1, (100, 300), 15, 5, 1, "Photo of book page OR Kindle screenshot"),
                tier("medium", "MEDIUM", 7, (300, 1000), 60, 3, 1, "Daily proof with page numbers"),
                tier("hard", "HARD", 30, (1000, 5000), 250, 5, 1, "Daily proof + OCR verification"),
                tier("expert", "EXPERT", 90, (2000, 10000), 750, 7, 1, "Daily proof + AI checks"),
            ],
        },
        ChallengeTemplate {
            id: "running".to_string(),
            title: "Running Challenge".to_string(),
            sponsor: None,
            unit_label: "run".to_string(),
            pacing: None,
            tiers: vec![
                running("easy", "Easy", 7, 150, "2 km"),
                running("medium", "Medium", 14, 300, "3 km"),
                running("hard", "Hard", 21, 500, "5 km"),
                running("expert", "Expert", 30, 750, "7 km"),
            ],
        },
        ChallengeTemplate {
            id: "instagram-detox".to_string(),
            title: "Instagram Detox".to_string(),
            sponsor: None,
            unit_label: "screenshot".to_string(),
            pacing: None,
            tiers: vec![
                with_target(
                    tier("easy", "EASY", 7, (300, 1000), 60, 3, 1, "Daily screenshot"),
                    "2h daily limit",
                ),
                with_target(
                    tier("medium", "MEDIUM", 14, (500, 2000), 150, 3, 1, "Daily screenshot"),
                    "1.5h daily limit",
                ),
                with_target(
                    tier("hard", "HARD", 21, (1000, 5000), 350, 5, 1, "Daily screenshot"),
                    "1h daily limit",
                ),
                with_target(
                    tier("expert", "EXPERT", 30, (2000, 10000), 750, 7, 1, "Daily screenshot + weekly check"),
                    "30 min daily limit",
                ),
            ],
        },
        ChallengeTemplate {
            id: "earlysleep".to_string(),
            title: "Early Sleep Challenge".to_string(),
            sponsor: Some("Sleep Foundation".to_string()),
            unit_label: "photo".to_string(),
            pacing: None,
            tiers: vec![
                tier("easy", "EASY", 7, (500, 1000), 50, 3, 1, "1 photo per day"),
                tier("medium", "MEDIUM", 21, (1000, 3000), 200, 5, 1, "Daily proof"),
                tier("hard", "HARD", 30, (2000, 5000), 400, 5, 1, "Daily proof"),
            ],
        },
    ]
}
