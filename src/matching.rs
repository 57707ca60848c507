//! Printer-model matching cascade (§4.I). Grounded in
//! `original_source/matching.py`.

use crate::brands;
use crate::model::SlicerType;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// A MODEL CATALOGUE entry (§6 catalogue data contract).
#[derive(Debug, Clone)]
pub struct CatalogueModel {
    pub id: u64,
    pub brand: String,
    pub name: String,
    pub slicer_profile_names: Vec<String>,
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

type Algo = fn(&str, &str, &str) -> bool;

fn direct_comparison(sp: &str, sl: &str, _brand: &str) -> bool {
    sp.trim() == sl.trim()
}

fn remove_dashes(sp: &str, sl: &str, _brand: &str) -> bool {
    collapse_ws(&sp.replace('-', " ")) == collapse_ws(&sl.replace('-', " "))
}

fn remove_spaces(sp: &str, sl: &str, _brand: &str) -> bool {
    sp.replace(' ', "") == sl.replace(' ', "")
}

static PAREN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\([^)]*\)").unwrap());

fn remove_parentheses(sp: &str, sl: &str, _brand: &str) -> bool {
    collapse_ws(&PAREN_RE.replace_all(sp, "")) == collapse_ws(&PAREN_RE.replace_all(sl, ""))
}

static BLTOUCH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)bltouch").unwrap());

fn remove_bltouch(sp: &str, sl: &str, _brand: &str) -> bool {
    collapse_ws(&BLTOUCH_RE.replace_all(sp, "")) == collapse_ws(&BLTOUCH_RE.replace_all(sl, ""))
}

static MMU_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)mmu[0-9]s?").unwrap());

fn remove_mmu(sp: &str, sl: &str, _brand: &str) -> bool {
    collapse_ws(&MMU_RE.replace_all(sp, "")) == collapse_ws(&MMU_RE.replace_all(sl, ""))
}

static SHAPER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)input shaper").unwrap());

fn remove_input_shaper(sp: &str, sl: &str, _brand: &str) -> bool {
    collapse_ws(&SHAPER_RE.replace_all(sp, "")) == collapse_ws(&SHAPER_RE.replace_all(sl, ""))
}

static BED_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)[0-9]+mm3?").unwrap());

fn remove_bed_size(sp: &str, sl: &str, _brand: &str) -> bool {
    collapse_ws(&BED_SIZE_RE.replace_all(sp, "")) == collapse_ws(&BED_SIZE_RE.replace_all(sl, ""))
}

static VORON_VER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"v([0-9])").unwrap());

fn voron_version_convert(sp: &str, sl: &str, brand: &str) -> bool {
    if brand != "voron" {
        return false;
    }
    let norm = |s: &str| -> String {
        let stripped = collapse_ws(&BED_SIZE_RE.replace_all(s, "")).to_lowercase();
        let stripped = stripped.replace("zero", "v0");
        match VORON_VER_RE.captures(&stripped) {
            Some(caps) => {
                let ver_num = &caps[1];
                if ver_num == "1" {
                    "v1".to_string()
                } else {
                    format!("v{ver_num}.x")
                }
            }
            None => stripped,
        }
    };
    norm(sp) == norm(sl)
}

fn prusa_split_model_names(sp: &str, sl: &str, brand: &str) -> bool {
    if brand != "prusa" || !sl.contains("&&") {
        return false;
    }
    let clean = |s: &str| -> String {
        let mut out = s.trim().to_string();
        if out.to_lowercase().starts_with("i3 ") {
            out = out[3..].to_string();
        }
        out = MMU_RE.replace_all(&out, "").to_string();
        out = SHAPER_RE.replace_all(&out, "").to_string();
        collapse_ws(&out)
    };
    let sp_clean = clean(sp);
    sl.split("&&").any(|part| clean(part) == sp_clean)
}

fn sovol_split_model_names(sp: &str, sl: &str, brand: &str) -> bool {
    if brand != "sovol" || !sl.contains('/') {
        return false;
    }
    let clean = |s: &str| collapse_ws(&BLTOUCH_RE.replace_all(s, ""));
    let sp_clean = clean(sp);
    sl.split('/').any(|part| clean(part) == sp_clean)
}

// `regex` has no lookaround, so the original's `-(?=[0-9])` and
// `(?<=[0-9])mm` are rewritten as capturing groups that reinsert the digit.
static DASH_DIGIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-([0-9])").unwrap());
static VCORE_3X_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"3\.[0-9]").unwrap());
static VCORE_4X_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"4\.[0-9]").unwrap());
static MM_AFTER_DIGIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9])mm").unwrap());

fn ratrig_vcore(sp: &str, sl: &str, brand: &str) -> bool {
    if brand != "rat rig" || !sl.trim().starts_with("v-core") {
        return false;
    }
    let sp = PAREN_RE.replace_all(sp, "").to_lowercase();
    let sl = PAREN_RE.replace_all(sl, "").to_lowercase();
    let sl = sl.replace("corexy ", "").replace("hybrid ", "");
    let sl = DASH_DIGIT_RE.replace_all(&sl, " $1");
    let sl = VCORE_3X_RE.replace_all(&sl, "3");
    let sl = VCORE_4X_RE.replace_all(&sl, "4");
    let sp = VCORE_4X_RE.replace_all(&sp, "4");
    let sl = MM_AFTER_DIGIT_RE.replace_all(&sl, "$1");
    let sp = MM_AFTER_DIGIT_RE.replace_all(&sp, "$1");
    let sl = sl.replace(" copy mode", "").replace(" mirror mode", "");
    sp == sl
}

static TRAILING_BED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" [0-9]{3,}$").unwrap());

fn alternate_remove_bed_size(sp: &str, sl: &str, _brand: &str) -> bool {
    collapse_ws(&TRAILING_BED_RE.replace(sp, "")) == collapse_ws(&TRAILING_BED_RE.replace(sl, ""))
}

const CHECK_MODEL_ALGOS: [Algo; 13] = [
    direct_comparison,
    remove_dashes,
    remove_spaces,
    remove_parentheses,
    remove_bltouch,
    remove_mmu,
    remove_input_shaper,
    remove_bed_size,
    voron_version_convert,
    prusa_split_model_names,
    sovol_split_model_names,
    ratrig_vcore,
    alternate_remove_bed_size,
];

/// Resolve a slicer's free-form printer name to catalogue model IDs.
pub fn match_printer_model(
    models: &[CatalogueModel],
    slicer: SlicerType,
    vendor: &str,
    printer_name: &str,
) -> Vec<u64> {
    let original_brand = vendor.to_lowercase();
    let brand = brands::normalize_brand(slicer, vendor);

    let catalogue_brands: HashSet<String> = models.iter().map(|m| m.brand.to_lowercase()).collect();
    if !catalogue_brands.contains(&brand) {
        return Vec::new();
    }

    let name_lower = printer_name.to_lowercase();
    let cleaned_name = brands::strip_brand_from_name(&name_lower, &brand, Some(&original_brand));

    let mut matched = Vec::new();
    for model in models {
        if model.brand.to_lowercase() != brand {
            continue;
        }
        let model_name_lower = model.name.to_lowercase();
        let cleaned_model = brands::strip_brand_from_name(&model_name_lower, &brand, None);

        let mut hit = CHECK_MODEL_ALGOS
            .iter()
            .any(|algo| algo(&cleaned_model, &cleaned_name, &brand));

        if !hit {
            hit = model
                .slicer_profile_names
                .iter()
                .any(|syn| syn.to_lowercase() == name_lower);
        }

        if hit {
            matched.push(model.id);
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_5_model_matching() {
        let models = vec![CatalogueModel {
            id: 42,
            brand: "bambu lab".to_string(),
            name: "X1 Carbon".to_string(),
            slicer_profile_names: vec![],
        }];
        let matched = match_printer_model(
            &models,
            SlicerType::BambuStudio,
            "BBL",
            "Bambu Lab X1 Carbon (0.4 nozzle)",
        );
        assert_eq!(matched, vec![42]);
    }

    #[test]
    fn unknown_brand_returns_empty() {
        let models = vec![CatalogueModel {
            id: 1,
            brand: "prusa".to_string(),
            name: "MK4".to_string(),
            slicer_profile_names: vec![],
        }];
        let matched = match_printer_model(&models, SlicerType::OrcaSlicer, "SomeUnknownVendor", "MK4");
        assert!(matched.is_empty());
    }

    #[test]
    fn voron_zero_maps_to_v0() {
        assert!(voron_version_convert("v0", "voron zero 120mm", "voron"));
    }

    #[test]
    fn prusa_ampersand_bundle_splits() {
        assert!(prusa_split_model_names(
            "mk4",
            "i3 MK4 MMU3 && i3 MK4S MMU3",
            "prusa"
        ));
    }

    #[test]
    fn ratrig_vcore_normalizes_dashes_and_versions() {
        assert!(ratrig_vcore(
            "v-core 3 300mm",
            "V-Core-3.1 CoreXY 300mm",
            "rat rig"
        ));
        assert!(ratrig_vcore(
            "v-core 3 300mm",
            "V-Core-3.0 300mm",
            "rat rig"
        ));
        assert!(ratrig_vcore(
            "v-core 4 300mm",
            "V-Core-4.2 Hybrid 300mm",
            "rat rig"
        ));
    }
}
