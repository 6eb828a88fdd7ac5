use std::path::{Path, PathBuf};

fn canon(p: &Path) -> PathBuf {
    std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf())
}

fn main() {
    println!("cargo:rustc-check-cfg=cfg(llama_ffi)");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LLAMA_CPP_DIR");
    println!("cargo:rerun-if-env-changed=LLAMA_CPP_LIB");

    let vendored = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../third_party/llama.cpp");
    let mut roots: Vec<PathBuf> = Vec::new();
    if let Ok(dir) = std::env::var("LLAMA_CPP_DIR") { roots.push(canon(Path::new(&dir))); }
    if vendored.exists() { roots.push(canon(&vendored)); }

    let Some(header) = roots
        .iter()
        .flat_map(|r| [r.join("include/llama.h"), r.join("llama.h")])
        .find(|h| h.exists())
    else {
        println!("cargo:warning=llama.h not found (set LLAMA_CPP_DIR); llama.cpp backend disabled");
        return;
    };

    let mut builder = bindgen::Builder::default()
        .header(header.to_string_lossy())
        .allowlist_function("llama_.*")
        .allowlist_type("llama_.*")
        .allowlist_var("LLAMA_.*");
    for root in &roots {
        for inc in ["", "include", "ggml/include"] {
            builder = builder.clang_arg(format!("-I{}", root.join(inc).display()));
        }
    }
    let bindings = match builder.generate() {
        Ok(b) => b,
        Err(e) => {
            println!("cargo:warning=bindgen failed for {}: {e}; llama.cpp backend disabled", header.display());
            return;
        }
    };
    let out = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR is set by cargo")).join("llama_bindings.rs");
    bindings.write_to_file(out).expect("write llama bindings");

    if let Ok(extra) = std::env::var("LLAMA_CPP_LIB") {
        for p in std::env::split_paths(&extra) {
            println!("cargo:rustc-link-search=native={}", canon(&p).display());
        }
    }
    for root in &roots {
        for p in ["build/src", "build/ggml/src", "build/src/Release", "build/ggml/src/Release", "build"] {
            let dir = root.join(p);
            if dir.exists() { println!("cargo:rustc-link-search=native={}", canon(&dir).display()); }
        }
    }

    println!("cargo:rustc-link-lib=static=llama");
    println!("cargo:rustc-link-lib=static=ggml");
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("apple-darwin") {
        println!("cargo:rustc-link-lib=c++");
        if std::env::var_os("CARGO_FEATURE_METAL").is_some() {
            println!("cargo:rustc-link-lib=framework=Metal");
            println!("cargo:rustc-link-lib=framework=Foundation");
        }
    } else if !target.contains("windows") {
        for lib in ["stdc++", "m", "dl", "pthread"] { println!("cargo:rustc-link-lib={lib}"); }
    }
    if std::env::var_os("CARGO_FEATURE_CUDA").is_some() {
        for lib in ["cudart", "cublas", "cublasLt", "cuda"] { println!("cargo:rustc-link-lib={lib}"); }
    }

    println!("cargo:rerun-if-changed={}", header.display());
    println!("cargo:rustc-cfg=llama_ffi");
}
