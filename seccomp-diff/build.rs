use std::process::Command;

// First libseccomp release with seccomp_export_bpf_mem().
const EXPORT_MEM_VERSION: (u32, u32) = (2, 6);

fn libseccomp_version() -> Option<(u32, u32)> {
    let output = Command::new("pkg-config")
        .args(["--modversion", "libseccomp"])
        .output()
        .ok()?;
    let version = String::from_utf8(output.stdout).ok()?;
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=PKG_CONFIG_PATH");

    match libseccomp_version() {
        Some(version) if version >= EXPORT_MEM_VERSION => {
            println!("cargo:rustc-cfg=libseccomp_2_6");
        }
        Some(_) => {}
        None => println!("cargo:warning=libseccomp not found by pkg-config, exporting BPF through a pipe"),
    }
}
