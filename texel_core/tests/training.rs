use std::path::PathBuf;

use serde_json::json;
use texel_core::{
    Activation, ComputeContext, ConnectivitySpec, Cost, ExportedModel, LayerSpec, Network,
    Precision, Preprocessing, ProviderRegistry, Trainer, TrainerState, TrainingScript,
};
use uuid::Uuid;

const XOR_SMOKE: &str = r#"
    [network]
    layers = [
        { type = "input", size = 1, neurons = 4 },
        { type = "neuron", size = 1, neurons = 2, activation = "linear", connectivity = { kind = "full" } },
    ]

    [problem]
    provider = "xorLike"
    test_samples = 4

    [training]
    learning_rates = [0.3]
    momentum = 0.0
    minibatch_size = 4
    minibatches = 100
    test_every = 10
"#;

fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("texel-{label}-{}", Uuid::new_v4()))
}

#[test]
fn test_xor_smoke_run_converges() {
    let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
    trainer.load_str(XOR_SMOKE).unwrap();
    let report = trainer.run().unwrap();
    assert_eq!(report.state, TrainerState::Stopped);
    assert_eq!(report.minibatches, 100);

    let history = trainer.evaluator().history();
    assert_eq!(history.len(), 10);
    let averages: Vec<f32> = history
        .windows(2)
        .map(|pair| (pair[0].error + pair[1].error) / 2.0)
        .collect();
    for pair in averages.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-6, "moving average rose: {averages:?}");
    }

    let best = report.best.unwrap();
    assert!(best.success_rate >= 0.95, "best success rate {}", best.success_rate);
    let model = trainer.best_model().unwrap();
    let summary = model.training.as_ref().unwrap();
    assert_eq!(summary.snapshot_index, best.minibatch);
    assert_eq!(summary.samples, best.minibatch * 4);
}

fn layered_specs() -> Vec<LayerSpec> {
    vec![
        LayerSpec::Input {
            size: 4,
            neurons: None,
            preprocessing: Preprocessing::None,
            precision: Precision::Full,
        },
        LayerSpec::Neuron {
            size: 4,
            neurons: None,
            activation: Activation::Tanh,
            connectivity: ConnectivitySpec::SquareFast { sparsity: 3 },
            precision: Precision::Reduced,
        },
        LayerSpec::Neuron {
            size: 2,
            neurons: None,
            activation: Activation::Relu,
            connectivity: ConnectivitySpec::Conv { kernels: 2, sparsity: 3 },
            precision: Precision::Full,
        },
        LayerSpec::Neuron {
            size: 1,
            neurons: Some(3),
            activation: Activation::Sigmoid,
            connectivity: ConnectivitySpec::FullNPoT,
            precision: Precision::Full,
        },
    ]
}

#[test]
fn test_export_reload_forward_is_bit_identical() {
    let ctx = ComputeContext::new("export").unwrap();
    let mut original = Network::new(ctx.clone(), &layered_specs(), Cost::Quadratic, 11).unwrap();
    let model = original.export(json!({ "name": "layered" }), None).unwrap();

    let path = temp_dir("export").join("model.json");
    model.write(&path).unwrap();
    let restored_model = ExportedModel::read(&path).unwrap();
    assert_eq!(restored_model, model);

    let fresh = ComputeContext::new("reload").unwrap();
    let mut restored = Network::from_export(fresh.clone(), &restored_model, Cost::Quadratic).unwrap();

    let mut input = ctx.buffer(4).unwrap();
    let values: Vec<f32> = (0..input.len()).map(|v| ((v * 37) % 11) as f32 / 11.0).collect();
    input.upload(&values).unwrap();
    let mut copy = fresh.buffer(4).unwrap();
    copy.upload(&values).unwrap();

    original.forward(&input, 0.0).unwrap();
    restored.forward(&copy, 0.0).unwrap();
    let a: Vec<u32> = original.output().to_vec().iter().map(|v| v.to_bits()).collect();
    let b: Vec<u32> = restored.output().to_vec().iter().map(|v| v.to_bits()).collect();
    assert_eq!(a, b);

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_export_rejects_other_topologies() {
    let ctx = ComputeContext::new("export").unwrap();
    let original = Network::new(ctx.clone(), &layered_specs(), Cost::Quadratic, 1).unwrap();
    let model = original.export(serde_json::Value::Null, None).unwrap();

    let mut other_specs = layered_specs();
    other_specs.pop();
    if let Some(LayerSpec::Neuron { neurons, .. }) = other_specs.last_mut() {
        *neurons = Some(4);
    }
    let mut other = Network::new(ctx, &other_specs, Cost::Quadratic, 1).unwrap();
    let err = other.load_export(&model).unwrap_err();
    assert_eq!(err.category(), "export");

    let mut json: serde_json::Value = serde_json::from_str(&model.to_json().unwrap()).unwrap();
    json["formatVersion"] = json!(99);
    assert!(ExportedModel::from_json(&json.to_string()).is_err());
}

#[test]
fn test_glyph_run_writes_artifacts() {
    let dir = temp_dir("glyphs");
    let script = format!(
        r#"
        [network]
        layers = [
            {{ type = "input", size = 16, preprocessing = "grayscaleLocalNorm" }},
            {{ type = "neuron", size = 8, activation = "relu", connectivity = {{ kind = "conv", kernels = 2, sparsity = 3 }} }},
            {{ type = "neuron", size = 2, neurons = 5, activation = "sigmoid", connectivity = {{ kind = "full" }} }},
        ]

        [problem]
        provider = "glyphs"
        background = "mixed"
        test_samples = 6
        pool = {{ size = 8, max_uses = 2 }}
        options = {{ size = 16, negatives = 0.2 }}

        [[augmentation]]
        kind = "affine"
        scale = [0.9, 1.1]
        rotation = [-15.0, 15.0]
        translation = 0.05

        [[augmentation]]
        kind = "elastic"
        magnitude = 0.05
        probability = 0.5

        [[augmentation]]
        kind = "colorJitter"
        hue = 0.1
        gamma = 0.2
        luminosity = 0.1

        [training]
        learning_rates = [0.05, 0.05]
        minibatch_size = 2
        minibatches = 6
        test_every = 3
        seed = 5

        [schedule]
        input_blur = {{ start = 1.5, end = 0.0, half_life = 2.0 }}
        output_blur = {{ start = 0.5, half_life = 1.0 }}

        [output]
        export_path = "{export}"
        checkpoint_path = "{checkpoint}"
        log_dir = "{logs}"
        "#,
        export = dir.join("best.json").display(),
        checkpoint = dir.join("best.bin").display(),
        logs = dir.join("logs").display(),
    );

    let mut trainer = Trainer::new(ProviderRegistry::with_builtins());
    trainer.load(script.parse::<TrainingScript>().unwrap()).unwrap();
    let report = trainer.run().unwrap();
    assert_eq!(report.state, TrainerState::Stopped);
    assert_eq!(trainer.evaluator().history().len(), 2);

    let exported = ExportedModel::read(dir.join("best.json")).unwrap();
    assert_eq!(exported.metadata["provider"], "glyphs");
    assert!(dir.join("best.bin").exists());
    let log = std::fs::read_to_string(dir.join("logs").join("evaluations.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 2);

    let _ = std::fs::remove_dir_all(&dir);
}
