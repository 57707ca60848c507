use super::prusaslicer::PrusaSlicerParser;
use crate::model::SlicerType;

pub fn parser() -> PrusaSlicerParser {
    PrusaSlicerParser { slicer: SlicerType::SuperSlicer }
}
