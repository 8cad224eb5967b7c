//! Stratified hotel quota: taxonomy in, per-cell targets out.

use std::collections::{BTreeMap, HashSet};

use hrs_core::{PolicyError, PriceTier, StratificationCell};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub total_hotels: u32,
    pub tier_weights: TierWeights,
    pub regions: Vec<RegionSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierWeights {
    pub economy: u32,
    pub comfort: u32,
    pub premium: u32,
    pub luxury: u32,
}

impl TierWeights {
    pub fn weight(&self, tier: PriceTier) -> u32 {
        match tier {
            PriceTier::Economy => self.economy,
            PriceTier::Comfort => self.comfort,
            PriceTier::Premium => self.premium,
            PriceTier::Luxury => self.luxury,
        }
    }

    pub fn total(&self) -> u64 {
        PriceTier::ALL.iter().map(|t| u64::from(self.weight(*t))).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub zones: Vec<ZoneSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSpec {
    /// Site-side business zone code; becomes the cell's `business_zone`.
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Taxonomy {
    pub fn region(&self, id: &str) -> Option<&RegionSpec> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// Six Guangzhou functional regions, three business zones each.
    pub fn builtin() -> Self {
        let region = |id: &str, name: &str, priority: i32, zones: [(&str, &str); 3]| RegionSpec {
            id: id.to_string(),
            name: Some(name.to_string()),
            priority,
            zones: zones
                .into_iter()
                .map(|(code, name)| ZoneSpec {
                    code: code.to_string(),
                    name: Some(name.to_string()),
                })
                .collect(),
        };
        Self {
            total_hotels: 270,
            tier_weights: TierWeights {
                economy: 4,
                comfort: 6,
                premium: 3,
                luxury: 2,
            },
            regions: vec![
                region(
                    "cbd",
                    "CBD business district",
                    10,
                    [
                        ("39584", "Zhujiang New Town / Wuyang New Town"),
                        ("39585", "East Railway Station / Tianhe Sports Center"),
                        ("39581", "Huanshi East Road"),
                    ],
                ),
                region(
                    "old-town",
                    "Old town cultural district",
                    9,
                    [
                        ("39580", "Haizhu Square / Beijing Road"),
                        ("39582", "Shamian Island / Shangxiajiu"),
                        ("39583", "Railway Station / Yuexiu Park"),
                    ],
                ),
                region(
                    "transport-hub",
                    "Transport hubs",
                    8,
                    [
                        ("39591", "Baiyun International Airport"),
                        ("39587", "Chimelong Panyu / Guangzhou South Station"),
                        ("920", "Baiyun Huangshi / Tongdewei"),
                    ],
                ),
                region(
                    "exhibition",
                    "Exhibition district",
                    7,
                    [
                        ("39589", "Pazhou Canton Fair Complex"),
                        ("39588", "Jiangnanxi / Textile City"),
                        ("40110", "Dashadi"),
                    ],
                ),
                region(
                    "resort-family",
                    "Resort and family district",
                    6,
                    [
                        ("14803", "Conghua Hot Springs"),
                        ("40109", "Baishuizhai / Gualv Square"),
                        ("95", "Huadu Sunac Cultural Tourism City"),
                    ],
                ),
                region(
                    "university-tech",
                    "University and tech district",
                    5,
                    [
                        ("39590", "Higher Education Mega Center"),
                        ("923", "Luogang Science City"),
                        ("42647", "Sino-Singapore Knowledge City"),
                    ],
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellQuota {
    pub cell: StratificationCell,
    pub target: u32,
    /// Scheduling priority of the cell's hotel list task.
    pub priority: i32,
}

/// Immutable result of one planning pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPlan {
    pub total: u32,
    pub cells: Vec<CellQuota>,
}

impl QuotaPlan {
    pub fn allocated(&self) -> u32 {
        self.cells.iter().map(|c| c.target).sum()
    }

    pub fn target_for(&self, cell: &StratificationCell) -> Option<u32> {
        self.cells.iter().find(|c| &c.cell == cell).map(|c| c.target)
    }

    pub fn by_region(&self) -> BTreeMap<String, u32> {
        let mut out = BTreeMap::new();
        for quota in &self.cells {
            *out.entry(quota.cell.region.clone()).or_default() += quota.target;
        }
        out
    }

    /// Cells of one region, or all cells for `None`.
    pub fn scoped(&self, region: Option<&str>) -> QuotaPlan {
        let cells: Vec<CellQuota> = self
            .cells
            .iter()
            .filter(|c| region.map_or(true, |r| c.cell.region == r))
            .cloned()
            .collect();
        QuotaPlan {
            total: cells.iter().map(|c| c.target).sum(),
            cells,
        }
    }
}

/// Split `total` evenly over `parts`; the first `total % parts` get one more.
fn even_split(total: u32, parts: usize) -> impl Iterator<Item = u32> {
    let parts = parts as u32;
    let base = total / parts;
    let extra = total % parts;
    (0..parts).map(move |i| base + u32::from(i < extra))
}

/// Largest-remainder split of `share` over the four tiers. Ties go to the
/// earlier tier in declared order.
fn split_tiers(share: u32, weights: &TierWeights) -> [u32; 4] {
    let total_weight = weights.total();
    let mut floors = [0u32; 4];
    let mut remainders = [(0u64, 0usize); 4];
    for (idx, tier) in PriceTier::ALL.iter().enumerate() {
        let scaled = u64::from(share) * u64::from(weights.weight(*tier));
        floors[idx] = (scaled / total_weight) as u32;
        remainders[idx] = (scaled % total_weight, idx);
    }
    let mut leftover = share - floors.iter().sum::<u32>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, idx) in remainders {
        if leftover == 0 {
            break;
        }
        floors[idx] += 1;
        leftover -= 1;
    }
    floors
}

fn validate(taxonomy: &Taxonomy) -> Result<(), PolicyError> {
    if taxonomy.regions.is_empty() {
        return Err(PolicyError::Config("taxonomy has no regions".to_string()));
    }
    if taxonomy.tier_weights.total() == 0 {
        return Err(PolicyError::Config("price tier weights must sum to a positive value".to_string()));
    }
    let mut region_ids = HashSet::new();
    for region in &taxonomy.regions {
        if !region_ids.insert(region.id.as_str()) {
            return Err(PolicyError::Config(format!("duplicate region {}", region.id)));
        }
        if region.zones.is_empty() {
            return Err(PolicyError::Config(format!("region {} has no business zones", region.id)));
        }
        let mut zone_codes = HashSet::new();
        for zone in &region.zones {
            if !zone_codes.insert(zone.code.as_str()) {
                return Err(PolicyError::Config(format!(
                    "duplicate business zone {} in region {}",
                    zone.code, region.id
                )));
            }
        }
    }
    Ok(())
}

/// Region share, then zone share, then weighted tier split. Deterministic and
/// the leaf sum always equals `total_hotels`.
pub fn allocate(taxonomy: &Taxonomy) -> Result<QuotaPlan, PolicyError> {
    validate(taxonomy)?;

    let mut cells = Vec::new();
    for (region, region_share) in taxonomy
        .regions
        .iter()
        .zip(even_split(taxonomy.total_hotels, taxonomy.regions.len()))
    {
        for (zone, zone_share) in region.zones.iter().zip(even_split(region_share, region.zones.len())) {
            let tiers = split_tiers(zone_share, &taxonomy.tier_weights);
            for (tier, target) in PriceTier::ALL.iter().zip(tiers) {
                cells.push(CellQuota {
                    cell: StratificationCell::new(region.id.clone(), zone.code.clone(), *tier),
                    target,
                    priority: region.priority + tier.priority(),
                });
            }
        }
    }

    Ok(QuotaPlan {
        total: taxonomy.total_hotels,
        cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn equal_weights(total: u32) -> Taxonomy {
        Taxonomy {
            total_hotels: total,
            tier_weights: TierWeights {
                economy: 1,
                comfort: 1,
                premium: 1,
                luxury: 1,
            },
            ..Taxonomy::builtin()
        }
    }

    #[test]
    fn builtin_taxonomy_reproduces_fixed_tier_counts() {
        let plan = allocate(&Taxonomy::builtin()).unwrap();
        assert_eq!(plan.cells.len(), 6 * 3 * 4);
        assert_eq!(plan.allocated(), 270);
        let cell = StratificationCell::new("cbd", "39584", PriceTier::Comfort);
        assert_eq!(plan.target_for(&cell), Some(6));
        let luxury = StratificationCell::new("university-tech", "923", PriceTier::Luxury);
        assert_eq!(plan.target_for(&luxury), Some(2));
        assert!(plan.by_region().values().all(|v| *v == 45));
    }

    #[test]
    fn even_regions_for_270() {
        let plan = allocate(&equal_weights(270)).unwrap();
        assert!(plan.by_region().values().all(|v| *v == 45));
    }

    #[test]
    fn remainder_goes_to_first_region() {
        let plan = allocate(&equal_weights(271)).unwrap();
        let by_region = plan.by_region();
        assert_eq!(by_region["cbd"], 46);
        assert_eq!(by_region.values().filter(|v| **v == 46).count(), 1);
        assert_eq!(plan.allocated(), 271);
    }

    #[test]
    fn tier_ties_break_in_declared_order() {
        assert_eq!(
            split_tiers(
                2,
                &TierWeights {
                    economy: 1,
                    comfort: 1,
                    premium: 1,
                    luxury: 1
                }
            ),
            [1, 1, 0, 0]
        );
    }

    #[test]
    fn priorities_combine_region_and_tier() {
        let plan = allocate(&Taxonomy::builtin()).unwrap();
        let first = &plan.cells[0];
        assert_eq!(first.cell.price_tier, PriceTier::Economy);
        assert_eq!(first.priority, 13);
        let max = plan.cells.iter().map(|c| c.priority).max();
        assert_eq!(max, Some(14));
    }

    #[test]
    fn config_errors() {
        let mut no_regions = Taxonomy::builtin();
        no_regions.regions.clear();
        assert!(matches!(allocate(&no_regions), Err(PolicyError::Config(_))));

        let mut empty_zone = Taxonomy::builtin();
        empty_zone.regions[2].zones.clear();
        assert!(matches!(allocate(&empty_zone), Err(PolicyError::Config(_))));

        let zero_weights = Taxonomy {
            tier_weights: TierWeights {
                economy: 0,
                comfort: 0,
                premium: 0,
                luxury: 0,
            },
            ..Taxonomy::builtin()
        };
        assert!(matches!(allocate(&zero_weights), Err(PolicyError::Config(_))));
    }

    #[test]
    fn scoped_plan_keeps_one_region() {
        let plan = allocate(&Taxonomy::builtin()).unwrap().scoped(Some("exhibition"));
        assert_eq!(plan.cells.len(), 12);
        assert_eq!(plan.total, 45);
    }

    fn arb_taxonomy() -> impl Strategy<Value = Taxonomy> {
        (
            0u32..5000,
            prop::collection::vec(1usize..6, 1..10),
            (0u32..20, 0u32..20, 0u32..20, 1u32..20),
        )
            .prop_map(|(total, zones_per_region, (e, c, p, l))| Taxonomy {
                total_hotels: total,
                tier_weights: TierWeights {
                    economy: e,
                    comfort: c,
                    premium: p,
                    luxury: l,
                },
                regions: zones_per_region
                    .into_iter()
                    .enumerate()
                    .map(|(r, zones)| RegionSpec {
                        id: format!("r{r}"),
                        name: None,
                        priority: 0,
                        zones: (0..zones)
                            .map(|z| ZoneSpec {
                                code: format!("z{z}"),
                                name: None,
                            })
                            .collect(),
                    })
                    .collect(),
            })
    }

    proptest! {
        #[test]
        fn leaf_sum_matches_total(taxonomy in arb_taxonomy()) {
            let plan = allocate(&taxonomy).unwrap();
            prop_assert_eq!(plan.allocated(), taxonomy.total_hotels);
            let expected_cells: usize = taxonomy.regions.iter().map(|r| r.zones.len() * 4).sum();
            prop_assert_eq!(plan.cells.len(), expected_cells);
            prop_assert_eq!(plan.clone(), allocate(&taxonomy).unwrap());
        }
    }
}
