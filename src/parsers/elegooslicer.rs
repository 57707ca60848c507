use super::slic3r_json::Slic3rJsonParser;
use crate::model::SlicerType;

pub fn parser() -> Slic3rJsonParser {
    Slic3rJsonParser { slicer: SlicerType::ElegooSlicer }
}
