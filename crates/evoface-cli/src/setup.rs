//! `evoface setup`: downloads and verifies the ONNX models of the pipeline.

use anyhow::{bail, Context, Result};
use evoface_models::{default_model_dir, sha256_file_hex, ModelFile, MODELS};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// State of a manifest entry already on disk.
#[derive(Debug, PartialEq, Eq)]
enum Presence {
    Missing,
    Verified,
    /// Present, but no checksum is pinned for it.
    Unpinned,
    Mismatch,
}

fn presence(model: &ModelFile, dest: &Path) -> Presence {
    if !dest.exists() {
        return Presence::Missing;
    }
    match (model.sha256, sha256_file_hex(dest)) {
        (None, _) => Presence::Unpinned,
        (Some(expected), Ok(digest)) if digest == expected => Presence::Verified,
        _ => Presence::Mismatch,
    }
}

/// Download one model into `dest` via a `.part` file, verifying the pinned
/// checksum before the rename.
fn download_model(model: &ModelFile, url: &str, dest: &Path) -> Result<()> {
    let tmp_path = dest.with_extension("onnx.part");

    println!("  downloading {} ({})...", model.name, model.size_display);

    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("failed to download {url}"))?;

    let content_length = resp
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut reader = resp.into_body().into_reader();
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    let mut last_pct: u64 = 0;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        total += n as u64;

        if let Some(len) = content_length.filter(|&len| len > 0) {
            let pct = (total * 100) / len;
            if pct / 10 > last_pct / 10 {
                print!("  {pct}%\r");
                io::stdout().flush().ok();
                last_pct = pct;
            }
        }
    }

    file.flush()?;
    drop(file);

    if let Some(expected) = model.sha256 {
        print!("  verifying checksum... ");
        io::stdout().flush().ok();
        let digest = sha256_file_hex(&tmp_path)?;
        if digest != expected {
            fs::remove_file(&tmp_path).ok();
            bail!(
                "checksum mismatch for {}:\n  expected: {}\n  got:      {}",
                model.name,
                expected,
                digest
            );
        }
        println!("ok");
    }

    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to rename {} -> {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    Ok(())
}

/// Run the setup command.
pub fn run(model_dir: Option<PathBuf>) -> Result<()> {
    let dir = model_dir.unwrap_or_else(default_model_dir);

    println!("Model directory: {}", dir.display());

    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut downloaded = 0;
    let mut present = 0;
    let mut manual = Vec::new();

    for model in MODELS {
        let dest = dir.join(model.name);
        match presence(model, &dest) {
            Presence::Verified => {
                println!("  {} already present (checksum ok)", model.name);
                present += 1;
                continue;
            }
            Presence::Unpinned => {
                println!("  {} already present (no pinned checksum)", model.name);
                present += 1;
                continue;
            }
            Presence::Mismatch => {
                println!("  {} exists but checksum differs, re-downloading", model.name);
            }
            Presence::Missing => {}
        }

        match model.url {
            Some(url) => {
                download_model(model, url, &dest)?;
                downloaded += 1;
            }
            None => manual.push(model),
        }
    }

    println!();
    println!("Setup: {downloaded} model(s) downloaded, {present} already present.");
    if !manual.is_empty() {
        println!("Place these files by hand before starting evofaced:");
        for model in &manual {
            println!("  {} ({})", dir.join(model.name).display(), model.size_display);
        }
        bail!("{} model(s) need manual placement", manual.len());
    }

    Ok(())
}
