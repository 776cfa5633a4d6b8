use anyhow::Result;
use ndarray::{Array2, s};
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::common::*;
use crate::common::SamplingMethod;
use crate::decoder::{DecodeInputs, DecoderConfig};
use crate::error::DecoderError;
use crate::search::{BeamSearch, DecodeStep, GreedySearch};
use crate::utils::masks::attention_bias_from_lengths;

#[test]
fn test_incremental_matches_full_sequence() -> Result<()> {
    init_logging();
    let model = small_decoder(small_config())?;
    let decoder_batch = segment_batch(vec![vec![1, 4, 5, 6, 3], vec![1, 7, 7, 8, 2]])?;
    let template = segment_batch(vec![vec![3, 4, 0, 5], vec![6, 8, 0, 0]])?;
    let memory = model.encode_template(&template)?;
    let bias = attention_bias_from_lengths(&[4, 2], 4);

    let full = model.decode_full(&decoder_batch, Some(&memory), Some(&bias), None)?;

    let inputs = DecodeInputs {
        memory: Some(&memory),
        memory_bias: Some(&bias),
        segment_ids: &decoder_batch.segment_ids,
        offsets: &decoder_batch.offsets,
    };
    let mut cache = model.init_cache(&inputs, 5, 1)?;
    for t in 0..5 {
        let tokens = decoder_batch.ids.column(t).to_vec();
        let step_logits = model.decode_step(&tokens, t, &mut cache)?;
        let expected = full.slice(s![.., t, ..]).to_owned();
        assert_all_close(&step_logits, &expected, 1e-4, &format!("step {}", t));
    }
    assert_eq!(cache.step_count(), 5);
    Ok(())
}

#[test]
fn test_expanded_cache_matches_full_sequence() -> Result<()> {
    let model = small_decoder(small_config())?;
    let decoder_batch = segment_batch(vec![vec![1, 4, 5], vec![1, 7, 8]])?;
    let template = segment_batch(vec![vec![3, 4], vec![6, 8]])?;
    let memory = model.encode_template(&template)?;

    let full = model.decode_full(&decoder_batch, Some(&memory), None, None)?;

    let inputs = DecodeInputs {
        memory: Some(&memory),
        memory_bias: None,
        segment_ids: &decoder_batch.segment_ids,
        offsets: &decoder_batch.offsets,
    };
    let beams = 3;
    let mut cache = model.init_cache(&inputs, 3, beams)?;
    for t in 0..3 {
        let tokens: Vec<u32> = decoder_batch
            .ids
            .column(t)
            .iter()
            .flat_map(|&id| std::iter::repeat(id).take(beams))
            .collect();
        let step_logits = model.decode_step(&tokens, t, &mut cache)?;
        for row in 0..step_logits.nrows() {
            let expected = full.slice(s![row / beams, t, ..]).to_owned();
            let actual = step_logits.row(row).to_owned();
            assert_all_close(&actual, &expected, 1e-4, &format!("row {} step {}", row, t));
        }
    }
    Ok(())
}

#[test]
fn test_beam_width_one_matches_greedy() -> Result<()> {
    init_logging();
    let model = small_decoder(small_config())?;
    let template = segment_batch(vec![vec![3, 4, 5], vec![6, 7, 8], vec![4, 4, 4]])?;
    let memory = model.encode_template(&template)?;
    let segment_ids = Array2::from_elem((3, 6), 1u32);
    let offsets = Array2::from_shape_fn((3, 6), |(_, t)| t as u32);
    let inputs = DecodeInputs {
        memory: Some(&memory),
        memory_bias: None,
        segment_ids: &segment_ids,
        offsets: &offsets,
    };
    let start = [BOS; 3];

    let mut greedy = GreedySearch::new(EOS, 6, SamplingMethod::Argmax);
    greedy.accumulate_after_eos = false;
    let greedy_out = model.greedy_decode(&greedy, &start, &inputs, None)?;

    let beam = BeamSearch::new(EOS, 1, 6, 0.0)?;
    let beam_out = model.beam_decode(&beam, &start, &inputs)?;

    for b in 0..3 {
        let len = greedy_out.lengths[b];
        assert_eq!(beam_out.lengths[[b, 0]], len, "row {}", b);
        assert_eq!(
            greedy_out.sequences.slice(s![b, ..len]),
            beam_out.sequences.slice(s![b, 0, ..len]),
            "row {}",
            b
        );
        assert!((greedy_out.log_probs[b] - beam_out.log_probs[[b, 0]]).abs() < 1e-4);
    }
    Ok(())
}

#[test]
fn test_dynamic_decode_greedy_and_beam() -> Result<()> {
    let template = segment_batch(vec![vec![3, 4, 5], vec![6, 7, 0]])?;
    let bias = attention_bias_from_lengths(&[3, 2], 3);
    let segment_ids = Array2::from_elem((2, 6), 1u32);
    let offsets = Array2::from_shape_fn((2, 6), |(_, t)| t as u32);

    let greedy_model = small_decoder(small_config())?;
    let preds = greedy_model.dynamic_decode(
        &template,
        Some(&bias),
        &segment_ids,
        &offsets,
        BOS,
        EOS,
        None,
    )?;
    assert_eq!(preds.sampled_ids.shape()[..2], [2, 1]);
    assert!(preds.sampled_ids.shape()[2] <= 6);
    assert_eq!(preds.log_probs.shape(), &[2, 1]);
    assert!(preds.log_probs.iter().all(|lp| lp.is_finite() && *lp <= 0.0));

    let beam_model = small_decoder(DecoderConfig {
        beam_width: 3,
        alpha: 0.6,
        ..small_config()
    })?;
    let preds = beam_model.dynamic_decode(
        &template,
        Some(&bias),
        &segment_ids,
        &offsets,
        BOS,
        EOS,
        None,
    )?;
    assert_eq!(preds.sampled_ids.shape()[..2], [2, 3]);
    assert!(preds.sampled_ids.shape()[2] <= 6);
    assert_eq!(preds.log_probs.shape(), &[2, 3]);
    assert!(preds.lengths.iter().all(|&l| l <= 6));
    assert!(preds.sampled_ids.iter().all(|&id| (id as usize) < VOCAB));
    Ok(())
}

#[test]
fn test_dynamic_decode_sampling_is_seeded() -> Result<()> {
    let model = small_decoder(DecoderConfig {
        sampling_method: SamplingMethod::Sample,
        ..small_config()
    })?;
    let template = segment_batch(vec![vec![3, 4, 5]])?;
    let segment_ids = Array2::from_elem((1, 6), 1u32);
    let offsets = Array2::from_shape_fn((1, 6), |(_, t)| t as u32);

    let err = model
        .dynamic_decode(&template, None, &segment_ids, &offsets, BOS, EOS, None)
        .unwrap_err();
    assert!(matches!(err, DecoderError::Configuration(_)));

    let run = |seed| {
        let mut rng = StdRng::seed_from_u64(seed);
        model.dynamic_decode(
            &template,
            None,
            &segment_ids,
            &offsets,
            BOS,
            EOS,
            Some(&mut rng),
        )
    };
    let first = run(5)?;
    let second = run(5)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_dynamic_decode_needs_positions_for_every_step() -> Result<()> {
    let model = small_decoder(small_config())?;
    let template = segment_batch(vec![vec![3, 4, 5]])?;
    let segment_ids = Array2::from_elem((1, 4), 1u32);
    let offsets = Array2::from_shape_fn((1, 4), |(_, t)| t as u32);
    let err = model
        .dynamic_decode(&template, None, &segment_ids, &offsets, BOS, EOS, None)
        .unwrap_err();
    assert!(matches!(err, DecoderError::ShapeMismatch { .. }));
    Ok(())
}

#[test]
fn test_generate_starts_from_configured_bos() -> Result<()> {
    let template = segment_batch(vec![vec![3, 4, 5], vec![6, 7, 8]])?;
    let segment_ids = Array2::from_elem((2, 6), 1u32);
    let offsets = Array2::from_shape_fn((2, 6), |(_, t)| t as u32);

    let model = small_decoder(small_config())?;
    let generated = model.generate(&template, None, &segment_ids, &offsets, None)?;
    let explicit = model.dynamic_decode(
        &template,
        None,
        &segment_ids,
        &offsets,
        model.config().bos_idx,
        model.config().eos_idx,
        None,
    )?;
    assert_eq!(generated, explicit);

    // a different start token changes the first decoder input
    let other_start = small_decoder(DecoderConfig {
        bos_idx: 4,
        ..small_config()
    })?;
    let shifted = other_start.generate(&template, None, &segment_ids, &offsets, None)?;
    let expected = model.dynamic_decode(&template, None, &segment_ids, &offsets, 4, EOS, None)?;
    assert_eq!(shifted, expected);
    Ok(())
}
