//! Architecture translation table. Maps a UTS machine name to the Debian
//! architecture, GNU triplet, cross toolchain and dynamic linker used when
//! building for that machine.

use std::collections::HashMap;
use std::env;

use lazy_static::lazy_static;

#[derive(Debug)]
pub struct MachineInfo {
    pub kernel: &'static str,
    pub deb: &'static str,
    pub uts_machine: &'static str,
    pub cross_compiler_prefix: Option<&'static str>,
    pub cross_build_packages: &'static [&'static str],
    pub triplet: &'static str,
    pub core_dynamic_linker: Option<&'static str>,
}

lazy_static! {
    static ref ARCH_TRANSLATIONS: HashMap<&'static str, MachineInfo> = {
        let mut map = HashMap::new();
        map.insert(
            "aarch64",
            MachineInfo {
                kernel: "arm64",
                deb: "arm64",
                uts_machine: "aarch64",
                cross_compiler_prefix: Some("aarch64-linux-gnu-"),
                cross_build_packages: &["gcc-aarch64-linux-gnu", "libc6-dev-arm64-cross"],
                triplet: "aarch64-linux-gnu",
                core_dynamic_linker: Some("lib/ld-linux-aarch64.so.1"),
            },
        );
        map.insert(
            "armv7l",
            MachineInfo {
                kernel: "arm",
                deb: "armhf",
                uts_machine: "arm",
                cross_compiler_prefix: Some("arm-linux-gnueabihf-"),
                cross_build_packages: &["gcc-arm-linux-gnueabihf", "libc6-dev-armhf-cross"],
                triplet: "arm-linux-gnueabihf",
                core_dynamic_linker: Some("lib/ld-linux-armhf.so.3"),
            },
        );
        map.insert(
            "i686",
            MachineInfo {
                kernel: "x86",
                deb: "i386",
                uts_machine: "i686",
                cross_compiler_prefix: None,
                cross_build_packages: &[],
                triplet: "i386-linux-gnu",
                core_dynamic_linker: None,
            },
        );
        map.insert(
            "ppc",
            MachineInfo {
                kernel: "powerpc",
                deb: "powerpc",
                uts_machine: "powerpc",
                cross_compiler_prefix: Some("powerpc-linux-gnu-"),
                cross_build_packages: &["gcc-powerpc-linux-gnu", "libc6-dev-powerpc-cross"],
                triplet: "powerpc-linux-gnu",
                core_dynamic_linker: None,
            },
        );
        map.insert(
            "ppc64le",
            MachineInfo {
                kernel: "powerpc",
                deb: "ppc64el",
                uts_machine: "ppc64el",
                cross_compiler_prefix: Some("powerpc64le-linux-gnu-"),
                cross_build_packages: &[
                    "gcc-powerpc64le-linux-gnu",
                    "libc6-dev-ppc64el-cross",
                ],
                triplet: "powerpc64le-linux-gnu",
                core_dynamic_linker: Some("lib64/ld64.so.2"),
            },
        );
        map.insert(
            "riscv64",
            MachineInfo {
                kernel: "riscv64",
                deb: "riscv64",
                uts_machine: "riscv64",
                cross_compiler_prefix: Some("riscv64-linux-gnu-"),
                cross_build_packages: &["gcc-riscv64-linux-gnu", "libc6-dev-riscv64-cross"],
                triplet: "riscv64-linux-gnu",
                core_dynamic_linker: Some("lib/ld-linux-riscv64-lp64d.so.1"),
            },
        );
        map.insert(
            "s390x",
            MachineInfo {
                kernel: "s390",
                deb: "s390x",
                uts_machine: "s390x",
                cross_compiler_prefix: Some("s390x-linux-gnu-"),
                cross_build_packages: &["gcc-s390x-linux-gnu", "libc6-dev-s390x-cross"],
                triplet: "s390x-linux-gnu",
                core_dynamic_linker: Some("lib/ld64.so.1"),
            },
        );
        map.insert(
            "x86_64",
            MachineInfo {
                kernel: "x86",
                deb: "amd64",
                uts_machine: "x86_64",
                cross_compiler_prefix: None,
                cross_build_packages: &[],
                triplet: "x86_64-linux-gnu",
                core_dynamic_linker: Some("lib64/ld-linux-x86-64.so.2"),
            },
        );
        map
    };
}

/// Translation for a UTS machine name, or a target architecture alias
/// expressed as a Debian architecture (e.g. `arm64`).
pub fn machine_info(machine: &str) -> Option<&'static MachineInfo> {
    ARCH_TRANSLATIONS.get(machine)
}

/// Find the UTS machine for a requested target, accepting either the
/// machine name itself or its Debian architecture name.
pub fn find_machine(target_arch: &str) -> Option<&'static str> {
    for (machine, info) in ARCH_TRANSLATIONS.iter() {
        if *machine == target_arch || info.deb == target_arch {
            return Some(machine);
        }
    }
    None
}

/// The UTS machine name of the host we are running on.
pub fn platform_machine() -> String {
    // std reports the LLVM target arch; translate the few names that
    // differ from uname output.
    let machine = match env::consts::ARCH {
        "x86" => "i686",
        "arm" => "armv7l",
        "powerpc" => "ppc",
        "powerpc64" => "ppc64le",
        other => other,
    };
    machine.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_machines_are_translated() {
        for machine in
            &["aarch64", "armv7l", "i686", "ppc", "ppc64le", "riscv64", "s390x", "x86_64"]
        {
            assert!(machine_info(machine).is_some(), "missing machine {}", machine);
        }
    }

    #[test]
    fn deb_arch_aliases_resolve() {
        assert_eq!(find_machine("arm64"), Some("aarch64"));
        assert_eq!(find_machine("amd64"), Some("x86_64"));
        assert_eq!(find_machine("armhf"), Some("armv7l"));
        assert_eq!(find_machine("mips"), None);
    }

    #[test]
    fn x86_64_has_a_dynamic_linker() {
        let info = machine_info("x86_64").unwrap();
        assert_eq!(info.triplet, "x86_64-linux-gnu");
        assert_eq!(info.core_dynamic_linker, Some("lib64/ld-linux-x86-64.so.2"));
    }
}
