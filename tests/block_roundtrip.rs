//! Block-level round-trip tests across the coding-option matrix, plus a
//! conformance vector decoded against a reference reconstruction.

use ebcot_rs::{
    BlockStyle, CodeBlock, CodingError, DistortionEstimation, EncodeOptions, Subband, Termination,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic pseudo-random coefficients in [-(2^(depth-1)-1), 2^(depth-1)-1].
fn noise_block(area: usize, bit_depth: u32, seed: u64) -> Vec<i64> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let peak = (1i64 << (bit_depth - 1)) - 1;
    (0..area)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % (2 * peak as u64 + 1)) as i64 - peak
        })
        .collect()
}

fn roundtrip(coefficients: &[i64], width: u32, height: u32, bit_depth: u32, options: &EncodeOptions) {
    for subband in [Subband::LL, Subband::HL, Subband::LH, Subband::HH] {
        let block =
            CodeBlock::encode(coefficients, width, height, subband, bit_depth, options).unwrap();
        let decoded = block.decode(bit_depth, options).unwrap();
        assert_eq!(decoded.error, None, "{:?} {:?}", subband, options.style);
        assert_eq!(decoded.coefficients, coefficients, "{:?} {:?}", subband, options.style);
    }
}

#[test]
fn roundtrip_across_geometries() {
    init_logger();
    let options = EncodeOptions::default();
    for (width, height) in [(4, 4), (8, 8), (16, 16), (64, 64), (1024, 4), (4, 1024), (12, 20)] {
        let coefficients = noise_block((width * height) as usize, 8, u64::from(width * 31 + height));
        roundtrip(&coefficients, width, height, 8, &options);
    }
}

#[test]
fn roundtrip_high_bit_depth() {
    init_logger();
    // Deep coefficients: 38-bit depth with 7 guard bits.
    let mut options = EncodeOptions::default();
    options.guard_bits = 7;
    let mut coefficients = noise_block(64, 38, 11);
    coefficients[0] = (1i64 << 37) - 1;
    coefficients[1] = -(1i64 << 37) + 5;
    roundtrip(&coefficients, 8, 8, 38, &options);
}

#[test]
fn roundtrip_termination_modes() {
    init_logger();
    let coefficients = noise_block(256, 8, 3);
    for termination in [Termination::Default, Termination::NearOptimal, Termination::Predictable] {
        let options = EncodeOptions {
            termination,
            ..EncodeOptions::default()
        };
        roundtrip(&coefficients, 16, 16, 8, &options);
    }
}

#[test]
fn roundtrip_style_matrix() {
    init_logger();
    let coefficients = noise_block(256, 8, 7);
    let styles = [
        BlockStyle::SELECTIVE_BYPASS,
        BlockStyle::RESET_CONTEXTS,
        BlockStyle::TERMINATE_PER_PASS,
        BlockStyle::VERTICALLY_CAUSAL,
        BlockStyle::PREDICTABLE_TERMINATION,
        BlockStyle::SEGMENTATION_SYMBOLS,
        BlockStyle::SELECTIVE_BYPASS | BlockStyle::TERMINATE_PER_PASS,
        BlockStyle::SELECTIVE_BYPASS
            | BlockStyle::VERTICALLY_CAUSAL
            | BlockStyle::RESET_CONTEXTS,
        BlockStyle::all(),
    ];
    for style in styles {
        let options = EncodeOptions {
            style,
            ..EncodeOptions::default()
        };
        roundtrip(&coefficients, 16, 16, 8, &options);
    }
}

#[test]
fn roundtrip_distortion_estimators() {
    init_logger();
    let coefficients = noise_block(256, 10, 19);
    for estimator in [
        DistortionEstimation::NormBased,
        DistortionEstimation::MseBased,
        DistortionEstimation::Simplified,
    ] {
        let options = EncodeOptions {
            distortion: estimator,
            ..EncodeOptions::default()
        };
        let block =
            CodeBlock::encode(&coefficients, 16, 16, Subband::HH, 10, &options).unwrap();
        // Distortion must accumulate and slopes must be usable numbers.
        let passes = block.passes();
        assert!(passes.last().unwrap().cumulative_distortion > 0.0);
        for pass in passes {
            assert!(pass.slope >= 0.0);
        }
        let decoded = block.decode(10, &options).unwrap();
        assert_eq!(decoded.coefficients, coefficients);
    }
}

#[test]
fn no_marker_collisions_in_segments() {
    init_logger();
    let options = EncodeOptions::default();
    for seed in 0..8 {
        let coefficients = noise_block(1024, 8, 100 + seed);
        let block =
            CodeBlock::encode(&coefficients, 32, 32, Subband::HL, 8, &options).unwrap();
        for pair in block.data().windows(2) {
            if pair[0] == 0xFF {
                assert!(pair[1] <= 0x8F, "marker collision in coded segment");
            }
        }
        assert_ne!(block.data().last(), Some(&0xFF));
    }
}

#[test]
fn truncated_block_reports_and_reconstructs() {
    init_logger();
    let options = EncodeOptions::default();
    let coefficients = noise_block(1024, 8, 5);
    let block = CodeBlock::encode(&coefficients, 32, 32, Subband::LL, 8, &options).unwrap();
    let bounds: Vec<usize> = block.passes().iter().map(|p| p.cumulative_bytes).collect();
    let cut = block.data().len() / 3;
    let rebuilt = CodeBlock::from_parts(
        Subband::LL,
        32,
        32,
        block.data()[..cut].to_vec(),
        block.zero_bit_planes(),
        block.pass_count(),
        Some(&bounds),
    )
    .unwrap();
    let decoded = rebuilt.decode(8, &options).unwrap();
    assert_eq!(decoded.error, Some(CodingError::Truncated));
    assert_eq!(decoded.coefficients.len(), coefficients.len());
    // The error is recoverable; callers may also swap in a zero block.
    assert!(decoded.clone().into_result().is_err());
}

// Reference reconstruction of a 32x32 HL code-block (13 coding passes,
// 5 missing bit-planes over a 10-bit-plane budget), as decoded by
// conforming implementations.
#[test]
fn conformance_vector_32x32_hl() {
    init_logger();
    let data: Vec<u8> = vec![
        225, 72, 111, 59, 122, 13, 70, 63, 48, 1, 128, 138, 167, 142, 136, 234, 176, 18,
        250, 155, 201, 209, 178, 22, 3, 122, 65, 71, 189, 9, 116, 133, 67, 58, 236, 36,
        96, 180, 149, 176, 210, 225, 171, 223, 90, 253, 30, 222, 151, 102, 39, 30, 60, 157,
        116, 17, 8, 141, 68, 131, 67, 132, 26, 211, 205, 234, 114, 234, 111, 228, 220, 77,
        234, 216, 84, 2, 25, 142, 108, 246, 245, 33, 60, 206, 71, 9, 179, 66, 149, 216,
        164, 135, 42, 146, 104, 78, 63, 79, 112, 108, 108, 114, 239, 235, 88, 168, 87, 191,
        194, 236, 134, 79, 1, 98, 61, 204, 148, 226, 181, 124, 207, 254, 19, 70, 229, 25,
        35, 118, 148, 10, 123, 207, 148, 214, 75, 143, 254, 109, 78, 34, 254, 242, 12, 97,
        100, 199, 130, 49, 4, 67, 50, 32, 3, 98, 70, 155, 104, 103, 90, 193, 89, 59,
        68, 148, 110, 7, 3, 141, 178, 237, 93, 253, 5, 69, 137, 207, 188, 149, 131, 59,
        203, 223, 41, 106, 78, 51, 223, 21, 113, 99, 204, 208, 145, 44, 51, 14, 133, 90,
        118, 136, 134, 167, 54, 22, 84, 84, 47, 206, 125, 89, 39, 60, 52, 175, 97, 228,
        217, 133, 171, 135, 129, 201, 164, 82, 3, 110, 200, 88, 1, 140, 235, 79, 57, 38,
        185, 197, 236, 33, 222, 117, 107, 156, 18, 78, 235, 63, 131, 57, 197, 153, 196, 178,
        254, 161, 28, 72, 103, 42, 31, 255, 56, 2, 18, 126, 95, 98, 19, 30, 233,
    ];
    let expected: Vec<i64> = vec![
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, -1,
        0, -2, 0, -1, 0, 1, 1, -1, 0, 0, 0, -1, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, -1, 0, 0, 1, 0, 0,
        0, 0, 2, 0, 0, 0, 1, 3, -2, 1, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0, 0, -1, 0, -2,
        -1, -2, -1, -1, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, -1,
        -1, 0, 0, -1, 0, -1, 1, 1, 0, 0, 0, 0, 0, 1, 1, -1, -2, 0,
        1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, -1,
        0, -1, 2, 1, 0, 1, 1, -1, 0, -2, 1, 4, -1, 0, 1, -1, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1, -1, 1, 0, 0, 0,
        0, 1, 1, 1, 2, -3, 2, 1, 1, -1, -1, 0, 0, 0, 0, 0, 0, 0,
        0, -1, -1, 0, 0, 0, 0, -1, 0, 1, -1, -1, 1, 1, 0, 1, 1, 0,
        -1, 3, -1, 1, 2, 0, 2, 0, 0, 0, 0, 0, 0, 0, -1, -1, 1, 1,
        0, 0, 0, 0, 0, 0, 0, -1, 1, 2, 0, -2, -1, -1, 1, 1, 0, -2,
        0, 0, -1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 1, 0, 0, 0,
        0, 2, 1, 0, 1, 1, 0, 0, -1, 1, -1, 0, 2, 2, 0, 1, 0, 0,
        0, 0, 0, 0, 0, 1, 1, 0, 0, 1, 0, 0, 0, 2, 1, 0, 1, 0,
        1, 0, -1, 0, 1, -2, -1, -3, -2, 0, 2, 1, 0, 0, 0, 0, 0, 0,
        0, -1, 0, 0, -1, -1, 0, 0, 0, -1, 0, 0, 0, -2, 2, 1, -3, 0,
        0, 0, 1, 0, -2, 0, 0, 0, -1, 0, 0, 0, 0, 1, -1, 0, 1, 0,
        1, 1, 0, 0, 0, 1, 0, 0, 1, 1, 1, -3, 2, -1, 2, 0, 1, 1,
        1, 0, 0, 2, 0, 0, 0, 0, 0, 1, 0, 0, 0, -1, 0, -1, 0, 1,
        1, 0, -1, 0, 1, 1, -3, 1, -1, -1, 3, 3, 1, 1, 0, 1, 1, 0,
        2, 1, 0, 0, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0, 1, 0, -1, 0,
        0, -2, 0, 1, 0, -2, 0, 1, 1, 3, 2, 0, 1, 1, 1, -1, 0, 0,
        0, 0, 1, 0, 1, 1, 0, 0, 1, 0, 0, 0, 1, 3, 0, 5, 1, 3,
        0, -1, 2, 3, -1, -2, 0, 2, 2, 0, 1, 1, -1, -1, 1, 0, 0, 0,
        0, 0, 1, 1, 0, 1, 0, 2, 0, -5, 2, -2, 0, -3, 0, -3, 1, 1,
        0, -1, 0, 0, 2, 2, -2, -1, -1, 1, -1, 0, 1, -1, 0, 1, 0, 0,
        0, 0, 0, -1, 3, 2, 1, 2, 0, -1, 0, -2, 2, 0, -1, -1, -1, 0,
        0, 0, 2, 0, 0, 1, 0, 1, 0, 0, 1, -1, -1, 1, 0, -1, -3, 3,
        1, -1, 0, -1, 0, 1, 2, 0, 1, 1, 0, 0, 1, 1, -2, -1, 0, -2,
        1, 0, -1, -1, 0, 0, 0, 1, 1, 0, 0, -2, -1, 1, -1, 0, 0, 0,
        1, 1, -1, 1, -1, 1, -1, 1, 0, 1, 1, -2, 0, 4, -1, 0, 2, 1,
        1, 1, 0, 0, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 1, 0, 1, 1,
        -1, 0, 0, 0, 3, -1, 2, 0, -3, -1, 0, 1, 0, 0, -1, -1, 1, 1,
        0, -2, 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, -1, 0, 0, 0, -2,
        1, 2, 2, 2, 2, -3, -1, 1, 1, 1, 0, -1, 1, 0, -1, 4, 1, -1,
        0, 0, 0, 0, 1, 0, 1, 0, -1, 0, 1, 0, 1, 1, 2, 2, 1, 2,
        2, 10, 0, 0, 0, 0, 1, 0, 1, -1, 1, 0, 0, 0, 0, 0, 0, 1,
        1, 0, -1, 1, 0, 2, 1, -1, 1, 0, 0, 2, -2, -2, 11, -4, 1, 1,
        1, 1, 0, -1, -3, 2, -1, 0, 1, 1, 0, 1, 0, 0, 1, 0, 0, 1,
        -1, -1, -1, 0, -1, 1, -2, 1, -2, 8, -8, -1, -1, 0, 1, 0, 0, -1,
        1, 1, 0, 1, 0, 0, 0, 1, 0, 0, 1, -1, 0, -1, 0, 0, 0, -1,
        1, 1, 0, 9, 16, -8, 1, 1, 0, 1, 0, 1, -1, 0, 1, 0, 0, 0,
        1, 0, 1, 0, 0, 0, 0, 0, 0, 0, -1, 0, 1, -1, 0, 0, 6, -7,
        -3, 0, 0, 0, 1, -1, -1, -1, 2, 2, 0, 1, 0, 1, 0, 1, 1, 1,
        0, 0, 0, 0, 0, 0, 1, 0, 0, 1, 1, 6, -9, 1, 1, -1, 1, 0,
        0, 1, 0, 1, 1, 0, 0, -1, 0, 0, 0, 0, 0, -1, 0, 0, 0, 0,
        1, 1, 1, -2, 0, 0, 6, -5, 2, 2, 0, 1, 0, 0, 0, -1, 1, 1,
        0, 0, 0, 0, 0, 1, 0, 0, -1, 0, 1, -1, 0, 1, 0, 1, 1, 1,
        1, 9, -9, 1, 1, 0, 1, 2, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0,
        -1, 0, 1, 0, 1, 1, 0, 0, 3, 1, 0, 1, -1, -2, 4, -9, 2, 0,
        0, -1, 0, -1, 0, 0, 1, -1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0,
        0, 1, 1, 0, 1, 1, 1, -1, -2, 9, 6, 5, 0, 0, -1, 0, 0, 0,
        1, 0, 1, 0, 1, 1, 1, 1, -1, 1, -1, 0, 0, -1, 1, 1, 0, 0,
        -1, 1, 0, -1, 10, -4, 0, 0, 0, 1, 0, 0, 0, 0, 1, 0,
    ];

    let options = EncodeOptions::default(); // 2 guard bits
    let block = CodeBlock::from_parts(Subband::HL, 32, 32, data, 5, 13, None).unwrap();
    let decoded = block.decode(8, &options).unwrap();
    assert_eq!(decoded.error, None);
    assert_eq!(decoded.coefficients, expected);

    // The reconstruction itself must survive a fresh round-trip.
    let reencoded =
        CodeBlock::encode(&expected, 32, 32, Subband::HL, 8, &options).unwrap();
    let again = reencoded.decode(8, &options).unwrap();
    assert_eq!(again.coefficients, expected);
}
