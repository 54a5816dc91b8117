//! Profiles of the visual-question-answering workflow used by tests and benchmarks.

use std::path::PathBuf;

use crate::{
    placement::WorkerSpec,
    profile::{
        AccuracySample, EndToEndAccuracyProfile, OperatorAccuracyProfile, ProfileGraph,
        ProfileRecords, ProfileStore,
    },
};

pub const IMAGE: &str = "ExtractImageFeature";
pub const ASR: &str = "SpeechRecognition";
pub const FUSION: &str = "VQA";
pub const VQA_E2E: &str = "vqa_e2e";

pub const FUSION_COST: f64 = 3.718242340022698;
/// `resnet18 + wav2vec2-base-960h + VQA(default)`
pub const MIN_TOTAL_COST: f64 = 6.1 + 8.92 + FUSION_COST;

/// `(variant, standalone accuracy, cost)`
pub const IMAGE_VARIANTS: [(&str, f64, f64); 5] = [
    ("resnet18", 89.078, 6.1),
    ("resnet34", 91.42, 9.7),
    ("resnet50", 92.866, 12.8),
    ("resnet101", 93.546, 17.10799),
    ("resnet152", 94.046, 23.935289945602417),
];

pub const ASR_VARIANTS: [(&str, f64, f64); 3] = [
    ("wav2vec2-base-960h", -3.4015, 8.92),
    ("wav2vec2-large-960h", -2.8152, 21.5),
    ("wav2vec2-large-960h-lv60-self", -1.8621, 24.441278224810958),
];

/// Fused accuracy, rows follow [`IMAGE_VARIANTS`], columns follow [`ASR_VARIANTS`].
pub const FUSION_ACCURACY: [[f64; 3]; 5] = [
    [53.02, 54.11, 55.47],
    [54.2, 55.38, 56.72],
    [55.12, 56.6, 57.94],
    [55.91, 56.95, 58.19],
    [56.08, 57.21, 58.33],
];

pub fn vqa_records() -> ProfileRecords {
    let samples = IMAGE_VARIANTS
        .iter()
        .zip(FUSION_ACCURACY)
        .flat_map(|((_, image_acc, _), row)| {
            ASR_VARIANTS
                .iter()
                .zip(row)
                .map(move |((_, asr_acc, _), fused)| {
                    AccuracySample::new(vec![*image_acc, *asr_acc], fused)
                })
        })
        .collect();
    let e2e = IMAGE_VARIANTS
        .iter()
        .zip(FUSION_ACCURACY)
        .fold(
            EndToEndAccuracyProfile::new(VQA_E2E, &[IMAGE, ASR]),
            |profile, ((image, _, _), row)| {
                ASR_VARIANTS
                    .iter()
                    .zip(row)
                    .fold(profile, |profile, ((asr, _, _), fused)| {
                        profile.with_entry(&[*image, *asr], fused)
                    })
            },
        );
    ProfileRecords::new(
        vec![
            OperatorAccuracyProfile::leaf(IMAGE, IMAGE_VARIANTS.iter().copied()),
            OperatorAccuracyProfile::leaf(ASR, ASR_VARIANTS.iter().copied()),
            OperatorAccuracyProfile::fusion(FUSION, &[IMAGE, ASR], FUSION_COST, samples),
        ],
        vec![e2e],
    )
}

pub fn vqa_graph() -> ProfileGraph {
    ProfileStore::load(vqa_records()).expect("VQA fixture profiles are valid")
}

/// Directory holding the same profiles as [`vqa_records`], one JSON file per record.
pub fn vqa_profiles_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets/vqa/profiles")
}

/// Example optimizer configuration for the VQA workflow.
pub fn vqa_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets/vqa/config.json")
}

/// Three workers large enough for any VQA assignment.
pub fn vqa_workers() -> Vec<WorkerSpec> {
    vec![
        WorkerSpec::new("gpu0", 40.0),
        WorkerSpec::new("gpu1", 40.0).with_speed_factor("resnet152", 0.8),
        WorkerSpec::new("cpu0", 20.0).with_default_speed(2.0),
    ]
}
