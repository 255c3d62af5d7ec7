use texel_core::{
    Activation, CheckpointError, Checkpointable, ComputeContext, ConnectivitySpec, Cost, LayerSpec,
    Network, NetworkBackup, Precision, Preprocessing, ProviderRegistry, Trainer, TrainerState,
};
use uuid::Uuid;

fn specs(hidden: usize) -> Vec<LayerSpec> {
    vec![
        LayerSpec::Input {
            size: 2,
            neurons: None,
            preprocessing: Preprocessing::None,
            precision: Precision::Full,
        },
        LayerSpec::Neuron {
            size: 2,
            neurons: Some(hidden),
            activation: Activation::Tanh,
            connectivity: ConnectivitySpec::Square { sparsity: 2 },
            precision: Precision::Full,
        },
        LayerSpec::Neuron {
            size: 1,
            neurons: Some(2),
            activation: Activation::Sigmoid,
            connectivity: ConnectivitySpec::Full,
            precision: Precision::Full,
        },
    ]
}

fn checkpoint_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("texel-checkpoint-{}.bin", Uuid::new_v4()))
}

#[test]
fn test_backup_round_trip_restores_weights() {
    let ctx = ComputeContext::new("checkpoint").unwrap();
    let trained = Network::new(ctx.clone(), &specs(16), Cost::Quadratic, 3).unwrap();
    let backup = trained.backup().unwrap();

    let path = checkpoint_path();
    backup.save_checkpoint(&path).unwrap();
    let loaded = NetworkBackup::load_checkpoint(&path).unwrap();
    assert_eq!(loaded, backup);

    let mut other = Network::new(ctx, &specs(16), Cost::Quadratic, 4).unwrap();
    assert_ne!(other.backup().unwrap(), backup);
    other.restore(&loaded).unwrap();
    assert_eq!(other.backup().unwrap(), backup);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_restore_rejects_other_topology() {
    let ctx = ComputeContext::new("checkpoint").unwrap();
    let backup = Network::new(ctx.clone(), &specs(16), Cost::Quadratic, 3)
        .unwrap()
        .backup()
        .unwrap();
    let mut smaller = Network::new(ctx, &specs(12), Cost::Quadratic, 3).unwrap();
    let err = smaller.restore(&backup).unwrap_err();
    assert_eq!(err.category(), "checkpoint");
}

#[test]
fn test_truncated_checkpoint_is_rejected() {
    let path = checkpoint_path();
    std::fs::write(&path, [1u8, 0, 0]).unwrap();
    assert!(matches!(
        NetworkBackup::load_checkpoint(&path),
        Err(CheckpointError::Serialization(_))
    ));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_trainer_warm_starts_from_backup() {
    let path = checkpoint_path();
    let script = |minibatches: usize, extra: &str| {
        format!(
            r#"
            [network]
            layers = [
                {{ type = "input", size = 1, neurons = 4 }},
                {{ type = "neuron", size = 1, neurons = 2, activation = "sigmoid", connectivity = {{ kind = "full" }} }},
            ]

            [problem]
            provider = "xorLike"
            test_samples = 4

            [training]
            learning_rates = [0.5]
            minibatch_size = 4
            minibatches = {minibatches}
            test_every = 5
            {extra}

            [output]
            checkpoint_path = "{}"
            "#,
            path.display()
        )
    };

    let mut first = Trainer::new(ProviderRegistry::with_builtins());
    first.load_str(&script(10, "")).unwrap();
    first.run().unwrap();
    let saved = NetworkBackup::load_checkpoint(&path).unwrap();

    let mut second = Trainer::new(ProviderRegistry::with_builtins());
    let warm = format!("backup_path = \"{}\"", path.display());
    second.load_str(&script(10, &warm)).unwrap();
    assert_eq!(second.state(), TrainerState::Paused);
    let network = second.network().unwrap();
    assert_eq!(network.backup().unwrap(), saved);

    let _ = std::fs::remove_file(&path);
}
