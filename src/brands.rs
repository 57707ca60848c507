//! Brand name normalization (§4.I input). Grounded in
//! `original_source/brands.py`.

use crate::model::SlicerType;
use std::collections::HashMap;
use std::sync::LazyLock;

fn shared_brand_map() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("ratrig", "rat rig"),
        ("biqu", "bigtreetech"),
        ("artillery", "artillery 3d"),
        ("anker", "ankermake"),
    ])
}

fn slicer_overrides(slicer: SlicerType) -> HashMap<&'static str, &'static str> {
    match slicer {
        SlicerType::PrusaSlicer | SlicerType::SuperSlicer => {
            HashMap::from([("prusaresearch", "prusa"), ("qiditechnology", "qidi tech")])
        }
        SlicerType::OrcaSlicer | SlicerType::BambuStudio | SlicerType::ElegooSlicer => HashMap::from([
            ("qidi", "qidi tech"),
            ("bbl", "bambu lab"),
            ("twotrees", "two trees"),
            ("positron3d", "positron 3d"),
            ("folgertech", "folger tech"),
            ("flyingbear", "flying bear"),
        ]),
        SlicerType::Cura => HashMap::from([
            ("prusa3d", "prusa"),
            ("vivedino, formbot", "vivedino"),
            ("zav co., ltd.", "zav"),
            ("velleman n.v.", "velleman"),
            ("creality3d", "creality"),
            ("jgaurora", "JGMaker/JGAurora"),
            ("sovol 3d", "sovol"),
            ("ultimaker b.v.", "ultimaker"),
            ("german reprap", "reprap"),
            ("vorondesign", "voron"),
            ("nwa 3d llc", "nwa3d"),
            ("unknown", "any generic printer"),
        ]),
    }
}

static BRAND_MAPS: LazyLock<HashMap<SlicerType, HashMap<&'static str, &'static str>>> = LazyLock::new(|| {
    SlicerType::ALL
        .into_iter()
        .map(|slicer| {
            let mut merged = shared_brand_map();
            merged.extend(slicer_overrides(slicer));
            (slicer, merged)
        })
        .collect()
});

/// Return the SimplyPrint-normalized brand name for a slicer vendor string.
/// Case-insensitive; unmapped vendors pass through lowercased.
pub fn normalize_brand(slicer: SlicerType, vendor: &str) -> String {
    let key = vendor.to_lowercase();
    BRAND_MAPS
        .get(&slicer)
        .and_then(|map| map.get(key.as_str()))
        .map(|s| s.to_string())
        .unwrap_or(key)
}

/// Remove the brand prefix from a printer model name. Tries the
/// SimplyPrint-normalized brand first, then the original slicer vendor
/// string. All comparisons are case-insensitive; `name` is expected already
/// lowercased.
pub fn strip_brand_from_name(name: &str, brand: &str, original_brand: Option<&str>) -> String {
    let name_lower = name.to_lowercase();

    if let Some(idx) = name_lower.find(brand) {
        return name_lower[idx + brand.len()..].trim().to_string();
    }

    if let Some(original) = original_brand {
        if original != brand {
            if let Some(idx) = name_lower.find(original) {
                return name_lower[idx + original.len()..].trim().to_string();
            }
        }
    }

    name_lower
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_map_applies_across_slicers() {
        assert_eq!(normalize_brand(SlicerType::OrcaSlicer, "RatRig"), "rat rig");
        assert_eq!(normalize_brand(SlicerType::Cura, "RatRig"), "rat rig");
    }

    #[test]
    fn per_slicer_override_wins() {
        assert_eq!(normalize_brand(SlicerType::OrcaSlicer, "BBL"), "bambu lab");
        assert_eq!(normalize_brand(SlicerType::Cura, "unknown"), "any generic printer");
    }

    #[test]
    fn unmapped_vendor_passes_through_lowercased() {
        assert_eq!(normalize_brand(SlicerType::BambuStudio, "Creality"), "creality");
    }

    #[test]
    fn strip_prefers_normalized_brand() {
        let stripped = strip_brand_from_name("bambu lab x1 carbon", "bambu lab", Some("bbl"));
        assert_eq!(stripped, "x1 carbon");
    }

    #[test]
    fn strip_falls_back_to_original_brand() {
        let stripped = strip_brand_from_name("bbl x1 carbon", "bambu lab", Some("bbl"));
        assert_eq!(stripped, "x1 carbon");
    }
}
