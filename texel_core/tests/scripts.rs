use std::path::PathBuf;

use texel_core::{ProviderRegistry, TrainingScript};

fn script(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("scripts")
        .join(name)
}

#[test]
fn test_bundled_scripts_validate() {
    let registry = ProviderRegistry::with_builtins();
    for (name, provider, layers) in [("xor_like.toml", "xorLike", 2), ("glyphs.toml", "glyphs", 4)] {
        let loaded = TrainingScript::load_from_file(script(name)).unwrap();
        let built = loaded.validate(&registry).unwrap();
        assert_eq!(built.name(), provider);
        assert_eq!(loaded.network.layers.len(), layers);
    }
}

#[test]
fn test_unknown_keys_are_rejected() {
    let text = std::fs::read_to_string(script("xor_like.toml")).unwrap();
    let broken = text.replace("minibatch_size", "minibatch_sise");
    let err = broken.parse::<TrainingScript>().unwrap_err();
    assert!(err.to_string().contains("minibatch_sise"), "{err}");
}
