use discv5::enr::NodeId;

use super::distance::{Metric, XorMetric};
use crate::utils::bytes::random_32byte_array;

/// Generate a random NodeId based on a target bucket index and a local node id.
/// First we generate a random distance with leading zeroes based on the target bucket.
/// Then we XOR the resulting distance with the local NodeId to get the target NodeId.
pub fn generate_random_node_id(target_bucket_idx: u8, local_node_id: NodeId) -> NodeId {
    let distance_leading_zeroes = 255 - target_bucket_idx;
    let random_distance = random_32byte_array(distance_leading_zeroes);

    let raw_node_id = XorMetric::distance(&local_node_id.raw(), &random_distance);

    raw_node_id.big_endian().into()
}
