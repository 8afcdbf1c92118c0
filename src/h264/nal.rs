//! H.264 NAL unit header constants (ISO/IEC 14496-10 Table 7-1).

pub const TYPE_SEI: u8 = 6;
pub const TYPE_SPS: u8 = 7;
pub const TYPE_PPS: u8 = 8;
pub const TYPE_IDR: u8 = 5;
pub const TYPE_STAP_A: u8 = 24;
pub const TYPE_FU_A: u8 = 28;

/// Human-readable name for a NAL unit type, for log messages.
pub fn type_name(nal_type: u8) -> &'static str {
    match nal_type {
        0 => "unspecified",
        1 => "slice_non_idr",
        2 => "slice_partition_a",
        3 => "slice_partition_b",
        4 => "slice_partition_c",
        5 => "slice_idr",
        6 => "sei",
        7 => "sps",
        8 => "pps",
        9 => "access_unit_delimiter",
        10 => "end_of_seq",
        11 => "end_of_stream",
        12 => "filler_data",
        13 => "sps_extension",
        14 => "prefix_nal_unit",
        15 => "subset_sps",
        19 => "slice_aux",
        20 => "slice_extension",
        21 => "slice_extension_3d",
        24 => "stap_a",
        25 => "stap_b",
        26 => "mtap16",
        27 => "mtap24",
        28 => "fu_a",
        29 => "fu_b",
        _ => "reserved",
    }
}

/// True for NAL types that belong in the keyframe-detection set
/// (IDR, SPS, PPS — see SPEC_FULL.md §4.3).
pub fn marks_keyframe(nal_type: u8) -> bool {
    matches!(nal_type, TYPE_IDR | TYPE_SPS | TYPE_PPS)
}

pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
