mod common;

use genqueue_common::GenqueueError;
use genqueue_core::checkpoint::{download_target, hub_cache_dir, hub_url, resolve};
use genqueue_core::output::OutputSink;

#[test]
fn resolves_the_first_cached_checkpoint() {
    let cache = common::scratch_dir("ckpt");
    let model = "openlm-research/open_llama_7b";
    let dir = hub_cache_dir(&cache, model);
    assert!(dir.ends_with("models--openlm-research--open_llama_7b"));

    let snapshot = dir.join("snapshots").join("main");
    std::fs::create_dir_all(&snapshot).unwrap();
    std::fs::write(snapshot.join("open_llama_7b.Q8_0.gguf"), b"x").unwrap();
    std::fs::write(snapshot.join("open_llama_7b.Q4_0.gguf"), b"x").unwrap();
    std::fs::write(snapshot.join("README.md"), b"x").unwrap();

    let found = resolve(model, &cache).unwrap();
    assert_eq!(found.file_name().unwrap(), "open_llama_7b.Q4_0.gguf");
}

#[test]
fn explicit_file_paths_bypass_the_cache() {
    let dir = common::scratch_dir("ckpt-direct");
    let file = dir.join("model.gguf");
    std::fs::write(&file, b"x").unwrap();
    assert_eq!(resolve(file.to_str().unwrap(), &dir.join("unused")).unwrap(), file);
}

#[test]
fn missing_checkpoints_are_reported() {
    let cache = common::scratch_dir("ckpt-missing");
    let err = resolve("org/absent", &cache).unwrap_err();
    assert!(matches!(err, GenqueueError::Checkpoint(_)));
    assert!(err.to_string().contains("genqueue pull"));

    std::fs::create_dir_all(hub_cache_dir(&cache, "org/empty")).unwrap();
    assert!(matches!(resolve("org/empty", &cache), Err(GenqueueError::Checkpoint(_))));
}

#[test]
fn hub_urls_and_download_targets() {
    assert_eq!(
        hub_url("openlm-research/open_llama_7b", "model.gguf", "main").unwrap(),
        "https://huggingface.co/openlm-research/open_llama_7b/resolve/main/model.gguf"
    );
    assert!(hub_url("not-a-repo", "model.gguf", "main").is_err());
    assert!(hub_url("a/b/c", "model.gguf", "main").is_err());

    let cache = std::path::Path::new("/cache");
    let target = download_target(cache, "org/repo", "sub/dir/model.gguf");
    assert_eq!(target, std::path::Path::new("/cache/models--org--repo/model.gguf"));
}

#[test]
fn output_sink_only_serves_declared_files() {
    let root = common::scratch_dir("outputs");
    let sink = OutputSink::new(&root, vec!["output.txt".into()]);
    let path = sink.write("task1", "output.txt", "hello").unwrap();
    assert_eq!(path, root.join("task1").join("output.txt"));
    assert_eq!(sink.read("task1", "output.txt").unwrap(), "hello");
    assert!(!root.join("task1").join(".output.txt.partial").exists());

    assert!(matches!(sink.write("task1", "other.txt", "x"), Err(GenqueueError::OutputNotFound(_))));
    assert!(matches!(sink.read("..", "output.txt"), Err(GenqueueError::OutputNotFound(_))));
    assert!(matches!(sink.read("task2", "output.txt"), Err(GenqueueError::OutputNotFound(_))));
}
