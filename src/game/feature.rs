//! Map features: wreckage, rocks, trees and other static world objects.

use crate::game::angle::SimAngle;
use crate::game::collections::TypedId;
use crate::game::math::SimVector;

pub struct FeatureIdTag;
pub type FeatureId = TypedId<FeatureIdTag>;

/// Identifies a feature definition in the kernel's definition table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FeatureDefinitionId(pub usize);

#[derive(Clone, Debug)]
pub struct MapFeature {
    pub feature_type: FeatureDefinitionId,
    pub position: SimVector,
    pub rotation: SimAngle,
}
