//! Video codec negotiation
//!
//! Each side advertises its format list with the encodable prefix marked by
//! `encoders_count`; everything a side advertises it can decode. The codec
//! this side encodes with is therefore the first shared format its own
//! encoder set supports.

use crate::protocol::VideoFormat;

/// Formats present in both lists, ordered by the local list
pub fn common_formats(local: &[VideoFormat], remote: &[VideoFormat]) -> Vec<VideoFormat> {
    local
        .iter()
        .filter(|format| remote.iter().any(|r| r.name == format.name))
        .cloned()
        .collect()
}

/// The format this side will encode with, if any
pub fn select_outgoing_format(
    local: &[VideoFormat],
    local_encoders: u8,
    remote: &[VideoFormat],
) -> Option<VideoFormat> {
    let encodable = &local[..(local_encoders as usize).min(local.len())];
    common_formats(local, remote)
        .into_iter()
        .find(|format| encodable.iter().any(|e| e.name == format.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formats(names: &[&str]) -> Vec<VideoFormat> {
        names.iter().copied().map(VideoFormat::new).collect()
    }

    #[test]
    fn test_intersection_keeps_local_order() {
        let local = formats(&["H264", "VP8", "VP9"]);
        let remote = formats(&["VP9", "H264"]);
        let common = common_formats(&local, &remote);
        let names: Vec<&str> = common.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["H264", "VP9"]);
    }

    #[test]
    fn test_negotiation_between_asymmetric_peers() {
        // One side encodes only H264, the other encodes both
        let a = formats(&["H264", "VP8"]);
        let b = formats(&["VP8", "H264"]);

        let a_out = select_outgoing_format(&a, 1, &b).unwrap();
        assert_eq!(a_out.name, "H264");

        let b_out = select_outgoing_format(&b, 2, &a).unwrap();
        assert_eq!(b_out.name, "VP8");
    }

    #[test]
    fn test_decode_only_formats_never_chosen() {
        let local = formats(&["VP8", "H264"]);
        let remote = formats(&["H264"]);
        // VP8 is the only encodable local format and the peer lacks it
        assert!(select_outgoing_format(&local, 1, &remote).is_none());
    }

    #[test]
    fn test_empty_intersection() {
        let local = formats(&["AV1"]);
        let remote = formats(&["H264", "VP8"]);
        assert!(common_formats(&local, &remote).is_empty());
        assert!(select_outgoing_format(&local, 1, &remote).is_none());
    }

    #[test]
    fn test_no_local_encoders() {
        let local = formats(&["H264"]);
        let remote = formats(&["H264"]);
        assert!(select_outgoing_format(&local, 0, &remote).is_none());
    }
}
