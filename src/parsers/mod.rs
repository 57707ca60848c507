//! Per-slicer profile parsers (§4.D).

pub mod bambustudio;
pub mod base;
pub mod cura;
pub mod elegooslicer;
pub mod orcaslicer;
pub mod prusaslicer;
pub mod slic3r_json;
pub mod superslicer;

pub use base::Parser;
use crate::model::SlicerType;

/// Return the parser for a given slicer as a trait object.
pub fn for_slicer(slicer: SlicerType) -> Box<dyn Parser> {
    match slicer {
        SlicerType::BambuStudio => Box::new(bambustudio::parser()),
        SlicerType::OrcaSlicer => Box::new(orcaslicer::parser()),
        SlicerType::ElegooSlicer => Box::new(elegooslicer::parser()),
        SlicerType::PrusaSlicer => Box::new(prusaslicer::PrusaSlicerParser { slicer }),
        SlicerType::SuperSlicer => Box::new(superslicer::parser()),
        SlicerType::Cura => Box::new(cura::CuraParser),
    }
}
