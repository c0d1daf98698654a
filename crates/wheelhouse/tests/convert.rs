//! End-to-end conversion tests: build a synthetic wheel in memory, run the
//! full engine, and pick the produced `.conda` container apart.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use data_encoding::HEXLOWER;
use wheelhouse::{convert_wheel, ConvertError, OutputLocation, WheelSource};
use zip::write::FileOptions;

struct WheelSpec {
    name: &'static str,
    version: &'static str,
    requires_python: Option<&'static str>,
    requires_dist: Vec<&'static str>,
    tag: &'static str,
    entry_points: Option<&'static str>,
    license: Option<&'static str>,
}

impl Default for WheelSpec {
    fn default() -> Self {
        Self {
            name: "sample_package",
            version: "2.0.0",
            requires_python: Some(">=3.10"),
            requires_dist: vec!["requests>=2.0"],
            tag: "py3-none-any",
            entry_points: None,
            license: Some("Apache-2.0"),
        }
    }
}

/// Builds a structurally faithful wheel: a package module, the dist-info
/// metadata files, and the RECORD/INSTALLER bookkeeping a real installer
/// would have produced.
fn build_wheel(spec: &WheelSpec) -> Vec<u8> {
    let dist_info = format!("{}-{}.dist-info", spec.name, spec.version);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default();

    let mut start = |writer: &mut zip::ZipWriter<Cursor<Vec<u8>>>, path: String, content: &[u8]| {
        writer.start_file(path, options).unwrap();
        writer.write_all(content).unwrap();
    };

    start(
        &mut writer,
        format!("{}/__init__.py", spec.name),
        b"__version__ = \"2.0.0\"\n",
    );
    start(
        &mut writer,
        format!("{}/core.py", spec.name),
        b"def main():\n    return 42\n",
    );

    let mut metadata = format!(
        "Metadata-Version: 2.1\nName: {}\nVersion: {}\nSummary: A sample package for testing\nHome-page: https://example.com\n",
        spec.name.replace('_', "-"),
        spec.version
    );
    if let Some(license) = spec.license {
        metadata.push_str(&format!("License: {license}\n"));
    }
    metadata.push_str("Project-URL: Documentation, https://docs.example.com\n");
    metadata.push_str("Project-URL: Source, https://github.com/example/sample\n");
    if let Some(requires_python) = spec.requires_python {
        metadata.push_str(&format!("Requires-Python: {requires_python}\n"));
    }
    for requirement in &spec.requires_dist {
        metadata.push_str(&format!("Requires-Dist: {requirement}\n"));
    }
    metadata.push_str("\n# Sample Package\n\nA longer description.\n");
    start(
        &mut writer,
        format!("{dist_info}/METADATA"),
        metadata.as_bytes(),
    );

    let wheel_file = format!(
        "Wheel-Version: 1.0\nGenerator: test 1.0\nRoot-Is-Purelib: true\nTag: {}\n",
        spec.tag
    );
    start(
        &mut writer,
        format!("{dist_info}/WHEEL"),
        wheel_file.as_bytes(),
    );

    if let Some(entry_points) = spec.entry_points {
        start(
            &mut writer,
            format!("{dist_info}/entry_points.txt"),
            entry_points.as_bytes(),
        );
    }

    start(&mut writer, format!("{dist_info}/INSTALLER"), b"pip\n");
    start(&mut writer, format!("{dist_info}/RECORD"), b"");

    writer.finish().unwrap().into_inner()
}

fn convert_bytes(
    wheel: Vec<u8>,
    filename: &str,
    output: &OutputLocation,
) -> Result<wheelhouse::ConversionResult, ConvertError> {
    convert_wheel(
        WheelSource::Stream {
            reader: Box::new(Cursor::new(wheel)),
            filename: filename.to_owned(),
        },
        output,
    )
}

fn convert_default(spec: &WheelSpec) -> (tempfile::TempDir, wheelhouse::ConversionResult) {
    let dir = tempfile::tempdir().unwrap();
    let filename = format!("{}-{}-{}.whl", spec.name, spec.version, spec.tag);
    let result = convert_bytes(
        build_wheel(spec),
        &filename,
        &OutputLocation::Directory(dir.path().to_path_buf()),
    )
    .unwrap();
    (dir, result)
}

/// Reads every file of the inner archive whose outer member name starts with
/// `prefix` (`info-` or `pkg-`).
fn read_inner_archive(conda_path: &Path, prefix: &str) -> HashMap<String, Vec<u8>> {
    let file = std::fs::File::open(conda_path).unwrap();
    let mut outer = zip::ZipArchive::new(file).unwrap();
    let member_name = (0..outer.len())
        .map(|i| outer.by_index(i).unwrap().name().to_owned())
        .find(|name| name.starts_with(prefix) && name.ends_with(".tar.zst"))
        .expect("inner archive present");

    let mut compressed = Vec::new();
    outer
        .by_name(&member_name)
        .unwrap()
        .read_to_end(&mut compressed)
        .unwrap();
    let decompressed = zstd::decode_all(compressed.as_slice()).unwrap();

    let mut contents = HashMap::new();
    let mut archive = tar::Archive::new(Cursor::new(decompressed));
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        contents.insert(path, content);
    }
    contents
}

fn info_json(conda_path: &Path, name: &str) -> serde_json::Value {
    let info = read_inner_archive(conda_path, "info-");
    serde_json::from_slice(&info[name]).unwrap()
}

#[test]
fn pure_wheel_with_marker_free_dep() {
    // Scenario: a pure wheel with one plain dependency.
    let (_dir, result) = convert_default(&WheelSpec::default());

    assert_eq!(
        result.path.file_name().unwrap().to_str().unwrap(),
        "sample-package-2.0.0-py_0.conda"
    );
    assert_eq!(result.subdir, "noarch");

    let index = info_json(&result.path, "info/index.json");
    assert_eq!(index["name"], "sample-package");
    assert_eq!(index["version"], "2.0.0");
    assert_eq!(index["build"], "py_0");
    assert_eq!(index["build_number"], 0);
    assert_eq!(index["subdir"], "noarch");
    assert_eq!(index["noarch"], "python");
    assert_eq!(index["license"], "Apache-2.0");
    assert_eq!(
        index["depends"],
        serde_json::json!(["python >=3.10", "requests >=2.0"])
    );
}

#[test]
fn container_has_exactly_three_members_in_order() {
    let (_dir, result) = convert_default(&WheelSpec::default());

    let file = std::fs::File::open(&result.path).unwrap();
    let mut outer = zip::ZipArchive::new(file).unwrap();
    let names: Vec<String> = (0..outer.len())
        .map(|i| outer.by_index(i).unwrap().name().to_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "metadata.json".to_owned(),
            "info-sample-package-2.0.0-py_0.tar.zst".to_owned(),
            "pkg-sample-package-2.0.0-py_0.tar.zst".to_owned(),
        ]
    );

    let mut manifest = Vec::new();
    outer
        .by_name("metadata.json")
        .unwrap()
        .read_to_end(&mut manifest)
        .unwrap();
    let manifest: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
    assert_eq!(manifest["conda_pkg_format_version"], 2);
}

#[test]
fn python_version_marker_translates_to_selector() {
    let (_dir, result) = convert_default(&WheelSpec {
        requires_dist: vec!["typing-extensions; python_version < '3.11'"],
        ..WheelSpec::default()
    });
    assert!(result
        .dependencies
        .contains(&"typing-extensions; if python <3.11".to_owned()));
}

#[test]
fn platform_and_platform_version_fuse() {
    let (_dir, result) = convert_default(&WheelSpec {
        requires_dist: vec!["foo; sys_platform == 'win32' and platform_version >= '10.0'"],
        ..WheelSpec::default()
    });
    assert!(result.dependencies.contains(&"foo; if __win >=10.0".to_owned()));
}

#[test]
fn extras_are_routed_to_extra_depends() {
    let (_dir, result) = convert_default(&WheelSpec {
        requires_dist: vec!["requests>=2.0", "pytest; extra == 'test'"],
        ..WheelSpec::default()
    });

    assert!(!result.dependencies.iter().any(|d| d.contains("pytest")));
    assert_eq!(result.extra_depends["test"], vec!["pytest"]);

    let index = info_json(&result.path, "info/index.json");
    assert_eq!(index["extra_depends"]["test"], serde_json::json!(["pytest"]));
    assert!(!index["depends"]
        .as_array()
        .unwrap()
        .iter()
        .any(|d| d.as_str().unwrap().contains("pytest")));
}

#[test]
fn unsupported_marker_fails_naming_the_variable() {
    let dir = tempfile::tempdir().unwrap();
    let wheel = build_wheel(&WheelSpec {
        requires_dist: vec!["x; platform_machine == 'x86_64'"],
        ..WheelSpec::default()
    });
    let err = convert_bytes(
        wheel,
        "sample_package-2.0.0-py3-none-any.whl",
        &OutputLocation::Directory(dir.path().to_path_buf()),
    )
    .unwrap_err();
    assert!(err.to_string().contains("platform_machine"));
}

#[test]
fn paths_json_matches_pkg_archive_contents() {
    // Every file in the pkg archive appears in paths.json with a hash that
    // re-verifies against the extracted bytes.
    let (_dir, result) = convert_default(&WheelSpec::default());

    let pkg = read_inner_archive(&result.path, "pkg-");
    let paths = info_json(&result.path, "info/paths.json");
    assert_eq!(paths["paths_version"], 1);

    let entries = paths["paths"].as_array().unwrap();
    assert_eq!(entries.len(), pkg.len());
    for entry in entries {
        let path = entry["_path"].as_str().unwrap();
        let content = pkg
            .get(path)
            .unwrap_or_else(|| panic!("{path} listed in paths.json but absent from pkg"));
        assert_eq!(entry["path_type"], "hardlink");
        assert_eq!(entry["size_in_bytes"], content.len() as u64);

        let digest = rattler_digest::compute_bytes_digest::<rattler_digest::Sha256>(content);
        assert_eq!(entry["sha256"].as_str().unwrap(), HEXLOWER.encode(&digest));
    }

    let files = read_inner_archive(&result.path, "info-");
    let files_list = String::from_utf8(files["info/files"].clone()).unwrap();
    let mut listed: Vec<&str> = files_list.lines().collect();
    let mut actual: Vec<&str> = pkg.keys().map(String::as_str).collect();
    listed.sort_unstable();
    actual.sort_unstable();
    assert_eq!(listed, actual);
}

#[test]
fn installer_is_replaced_with_conda() {
    let (_dir, result) = convert_default(&WheelSpec::default());
    let pkg = read_inner_archive(&result.path, "pkg-");

    let installers: Vec<&String> = pkg
        .keys()
        .filter(|path| path.ends_with("/INSTALLER"))
        .collect();
    assert_eq!(installers.len(), 1);
    assert_eq!(
        installers[0],
        "site-packages/sample_package-2.0.0.dist-info/INSTALLER"
    );
    assert_eq!(pkg[installers[0]], b"conda\n");
}

#[test]
fn platform_wheel_goes_to_its_subdir_without_noarch() {
    let spec = WheelSpec {
        tag: "cp311-cp311-win_amd64",
        ..WheelSpec::default()
    };
    let channel = tempfile::tempdir().unwrap();
    let result = convert_bytes(
        build_wheel(&spec),
        "sample_package-2.0.0-cp311-cp311-win_amd64.whl",
        &OutputLocation::Channel(channel.path().to_path_buf()),
    )
    .unwrap();

    assert_eq!(result.subdir, "win-64");
    assert_eq!(
        result.path,
        channel
            .path()
            .join("win-64")
            .join("sample-package-2.0.0-py_0.conda")
    );

    let index = info_json(&result.path, "info/index.json");
    assert_eq!(index["subdir"], "win-64");
    assert!(index.get("noarch").is_none());

    let info = read_inner_archive(&result.path, "info-");
    assert!(!info.contains_key("info/link.json"));
}

#[test]
fn pure_wheel_gets_link_json_with_entry_points() {
    let (_dir, result) = convert_default(&WheelSpec {
        entry_points: Some("[console_scripts]\nsample = sample_package.core:main\n"),
        ..WheelSpec::default()
    });

    assert_eq!(result.entry_points, vec!["sample = sample_package.core:main"]);

    let link = info_json(&result.path, "info/link.json");
    assert_eq!(link["noarch"]["type"], "python");
    assert_eq!(link["package_metadata_version"], 1);
    assert_eq!(
        link["noarch"]["entry_points"],
        serde_json::json!(["sample = sample_package.core:main"])
    );
}

#[test]
fn about_json_carries_only_present_fields() {
    let (_dir, result) = convert_default(&WheelSpec::default());
    let about = info_json(&result.path, "info/about.json");

    assert_eq!(about["summary"], "A sample package for testing");
    assert_eq!(about["home"], "https://example.com");
    assert_eq!(about["doc_url"], "https://docs.example.com");
    assert_eq!(about["source_url"], "https://github.com/example/sample");
    assert!(about
        .as_object()
        .unwrap()
        .get("dev_url")
        .is_none());
    assert!(about["description"]
        .as_str()
        .unwrap()
        .contains("# Sample Package"));
}

#[test]
fn conversion_from_path_matches_stream() {
    let dir = tempfile::tempdir().unwrap();
    let wheel_path = dir.path().join("sample_package-2.0.0-py3-none-any.whl");
    std::fs::write(&wheel_path, build_wheel(&WheelSpec::default())).unwrap();

    let result = convert_wheel(
        WheelSource::Path(wheel_path),
        &OutputLocation::Directory(dir.path().to_path_buf()),
    )
    .unwrap();
    assert_eq!(result.name.as_str(), "sample-package");
    assert!(result.path.exists());
}

#[test]
fn wheel_without_dist_info_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("just_a_module.py", FileOptions::default())
        .unwrap();
    writer.write_all(b"x = 1\n").unwrap();
    let bytes = writer.finish().unwrap().into_inner();

    let err = convert_bytes(
        bytes,
        "broken-1.0-py3-none-any.whl",
        &OutputLocation::Directory(dir.path().to_path_buf()),
    )
    .unwrap_err();
    assert!(matches!(err, ConvertError::MissingDistInfo));
}

#[test]
fn garbage_bytes_are_a_malformed_wheel() {
    let dir = tempfile::tempdir().unwrap();
    let err = convert_bytes(
        b"definitely not a zip".to_vec(),
        "broken-1.0-py3-none-any.whl",
        &OutputLocation::Directory(dir.path().to_path_buf()),
    )
    .unwrap_err();
    assert!(matches!(err, ConvertError::Archive(_)));
}
