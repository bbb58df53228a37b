//! ELF inspection and runtime library resolution for the prime step. Each
//! primed binary is parsed for its dynamic dependencies, which are then
//! resolved against the prime/stage trees (and optionally a base root)
//! via the loader, falling back to crawling the search paths; the
//! resulting closure is recorded in prime state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use goblin::elf::header::{et_to_str, EI_CLASS, EI_DATA};
use goblin::elf::note::NT_GNU_BUILD_ID;
use goblin::elf::program_header::{PF_X, PT_GNU_STACK};
use goblin::elf::section_header::SHT_NOBITS;
use goblin::elf::Elf;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;

use crate::env::get_library_paths;
use crate::errors::{Error, Result};

/// Identifies the architecture of an ELF file: `EI_CLASS` (word size),
/// `EI_DATA` (byte order) and `e_machine` (instruction set). Libraries
/// only satisfy dependents with an equal tuple.
pub type ElfArch = (u8, u8, u16);

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// A library referenced by `DT_NEEDED`, with the symbol versions the
/// dependent requires from it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NeededLibrary {
    pub name: String,
    pub versions: BTreeSet<String>,
}

/// Cache of resolved sonames, keyed by architecture so multi-arch trees
/// do not alias. Lives for one lifecycle.
#[derive(Debug, Default)]
pub struct SonameCache {
    paths: HashMap<(ElfArch, String), PathBuf>,
}

impl SonameCache {
    pub fn get(&self, arch: ElfArch, soname: &str) -> Option<&PathBuf> {
        self.paths.get(&(arch, soname.to_string()))
    }

    pub fn insert(&mut self, arch: ElfArch, soname: String, path: PathBuf) {
        self.paths.insert((arch, soname), path);
    }

    /// Drop every entry whose resolved path lives outside `root`.
    pub fn reset_except_root(&mut self, root: &Path) {
        self.paths.retain(|_, path| path.starts_with(root));
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug)]
pub struct ElfFile {
    pub path: PathBuf,
    pub arch: ElfArch,
    pub interp: String,
    pub soname: String,
    pub needed: BTreeMap<String, NeededLibrary>,
    pub execstack_set: bool,
    pub is_dynamic: bool,
    pub build_id: String,
    pub has_debug_info: bool,
    pub elf_type: String,
}

impl ElfFile {
    /// Whether `path` is a regular file starting with the ELF magic.
    pub fn is_elf(path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        let mut magic = [0u8; 4];
        match fs::File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
            Ok(()) => &magic == ELF_MAGIC,
            Err(_) => false,
        }
    }

    pub fn new(path: &Path) -> Result<ElfFile> {
        debug!("extracting ELF attributes: {:?}", path);
        let data = fs::read(path)?;
        let elf = Elf::parse(&data).map_err(|e| Error::CorruptedElf {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let arch =
            (elf.header.e_ident[EI_CLASS], elf.header.e_ident[EI_DATA], elf.header.e_machine);

        let mut needed: BTreeMap<String, NeededLibrary> = BTreeMap::new();
        for library in &elf.libraries {
            needed.insert(
                library.to_string(),
                NeededLibrary { name: library.to_string(), versions: BTreeSet::new() },
            );
        }

        // Versioned symbol requirements; a library that only provides weak
        // symbols may appear here without a DT_NEEDED entry, skip those.
        if let Some(ref verneed) = elf.verneed {
            for need in verneed.iter() {
                let file = elf.dynstrtab.get_at(need.vn_file as usize).unwrap_or("");
                if let Some(library) = needed.get_mut(file) {
                    for aux in need.iter() {
                        if let Some(version) = elf.dynstrtab.get_at(aux.vna_name as usize) {
                            library.versions.insert(version.to_string());
                        }
                    }
                }
            }
        }

        let mut execstack_set = false;
        for segment in &elf.program_headers {
            if segment.p_type == PT_GNU_STACK && segment.p_flags & PF_X != 0 {
                execstack_set = true;
            }
        }

        let mut build_id = String::new();
        if let Some(notes) = elf.iter_note_headers(&data) {
            for note in notes {
                let note = match note {
                    Ok(note) => note,
                    Err(_) => continue,
                };
                if note.name == "GNU" && note.n_type == NT_GNU_BUILD_ID {
                    build_id = note.desc.iter().map(|b| format!("{:02x}", b)).collect();
                }
            }
        }

        let mut has_debug_info = false;
        for section in &elf.section_headers {
            if elf.shdr_strtab.get_at(section.sh_name) == Some(".debug_info")
                && section.sh_type != SHT_NOBITS
            {
                has_debug_info = true;
            }
        }

        Ok(ElfFile {
            path: path.to_path_buf(),
            arch,
            interp: elf.interpreter.unwrap_or("").to_string(),
            soname: elf.soname.unwrap_or("").to_string(),
            needed,
            execstack_set,
            is_dynamic: elf.dynamic.is_some(),
            build_id,
            has_debug_info,
            elf_type: et_to_str(elf.header.e_type).to_string(),
        })
    }

    /// The highest `GLIBC_x.y` tag required across all versioned symbols.
    pub fn required_glibc(&self) -> String {
        let mut required = String::new();
        for library in self.needed.values() {
            for version in &library.versions {
                let version = match version.strip_prefix("GLIBC_") {
                    Some(version) => version,
                    None => continue,
                };
                if compare_versions(version, &required) == std::cmp::Ordering::Greater {
                    required = version.to_string();
                }
            }
        }
        required
    }

    /// Whether a linker of the given glibc version satisfies this file.
    pub fn is_linker_compatible(&self, linker_version: &str) -> bool {
        let required = self.required_glibc();
        let compatible =
            compare_versions(&required, linker_version) != std::cmp::Ordering::Greater;
        debug!(
            "linker {:?} satisfies GLIBC_{} required by {:?}: {}",
            linker_version, required, self.path, compatible
        );
        compatible
    }

    /// Resolve this file's runtime dependencies, returning the paths not
    /// already provided by the base root. The soname cache carries
    /// resolutions across files within one lifecycle.
    pub fn load_dependencies(
        &self,
        root_path: &Path,
        core_base_path: Option<&Path>,
        content_dirs: &[PathBuf],
        arch_triplet: &str,
        cache: &mut SonameCache,
    ) -> BTreeSet<PathBuf> {
        debug!("getting dependencies for {:?}", self.path);

        let mut search_paths: Vec<PathBuf> = vec![root_path.to_path_buf()];
        search_paths.extend(content_dirs.iter().cloned());
        if let Some(base) = core_base_path {
            search_paths.push(base.to_path_buf());
        }

        let mut ld_library_paths: Vec<PathBuf> = Vec::new();
        for path in &search_paths {
            ld_library_paths.extend(get_library_paths(path, arch_triplet, true));
        }

        let mut dependencies = BTreeSet::new();
        for (soname, soname_path) in ldd(&self.path, &ld_library_paths) {
            let resolved =
                crawl_for_path(&soname, &soname_path, &search_paths, self.arch, cache);
            let in_base = core_base_path.map(|base| resolved.starts_with(base)).unwrap_or(false);
            debug!(
                "{} with original path {:?} found on {:?} in base: {}",
                soname, soname_path, resolved, in_base
            );
            if !in_base {
                dependencies.insert(resolved);
            }
        }
        dependencies
    }
}

/// Resolve library mappings for `path` the way `ldd` sees them under the
/// given library search paths. Unresolved sonames map to themselves.
pub fn ldd(path: &Path, ld_library_paths: &[PathBuf]) -> BTreeMap<String, PathBuf> {
    let joined = std::env::join_paths(ld_library_paths)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!("invoking ldd with LD_LIBRARY_PATH={:?}", joined);

    let output = Command::new("ldd").arg(path).env("LD_LIBRARY_PATH", joined).output();
    let output = match output {
        Ok(ref output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        _ => {
            warn!("unable to determine library dependencies for {:?}", path);
            return BTreeMap::new();
        }
    };

    parse_ldd_output(&output)
}

lazy_static! {
    static ref LDD_RESOLVED: Regex = Regex::new(r"^\s*(.*) => (.*) \(0x").unwrap();
    static ref LDD_UNRESOLVED: Regex = Regex::new(r"^\s*(.*) => (.*)$").unwrap();
}

/// Parse `ldd` output lines of the forms `NAME => /path (0x...)` and
/// `NAME => not found`. Lines for the vDSO and the dynamic linker itself
/// either match neither form or resolve to an empty path and are ignored.
pub(crate) fn parse_ldd_output(output: &str) -> BTreeMap<String, PathBuf> {
    let mut libraries = BTreeMap::new();
    for line in output.lines() {
        let (soname, soname_path) = match LDD_RESOLVED.captures(line) {
            Some(captures) => (captures[1].to_string(), captures[2].to_string()),
            None => match LDD_UNRESOLVED.captures(line) {
                Some(captures) => (captures[1].to_string(), captures[2].to_string()),
                None => continue,
            },
        };
        if soname.is_empty() || soname_path.is_empty() {
            continue;
        }
        let resolved = if soname_path.starts_with('/') && Path::new(&soname_path).exists() {
            PathBuf::from(&soname_path)
        } else {
            PathBuf::from(&soname)
        };
        libraries.insert(soname, resolved);
    }
    libraries
}

fn is_valid_elf(path: &Path, arch: ElfArch) -> bool {
    if !path.exists() || !ElfFile::is_elf(path) {
        return false;
    }
    match ElfFile::new(path) {
        Ok(elf_file) => elf_file.arch == arch,
        Err(error) => {
            warn!("{}", error);
            false
        }
    }
}

/// Find the on-disk location of `soname`: trust the loader's resolution
/// when it points inside the search paths, otherwise walk the search
/// paths for a file with the right name and architecture.
fn crawl_for_path(
    soname: &str,
    soname_path: &Path,
    search_paths: &[PathBuf],
    arch: ElfArch,
    cache: &mut SonameCache,
) -> PathBuf {
    if let Some(found) = cache.get(arch, soname) {
        return found.clone();
    }

    debug!("crawling to find soname {:?}", soname);
    let valid_search_paths: Vec<&PathBuf> =
        search_paths.iter().filter(|p| p.exists()).collect();

    let in_search_paths = valid_search_paths.iter().any(|p| soname_path.starts_with(p));
    if in_search_paths && is_valid_elf(soname_path, arch) {
        cache.insert(arch, soname.to_string(), soname_path.to_path_buf());
        return soname_path.to_path_buf();
    }

    for search_path in valid_search_paths {
        for entry in walkdir::WalkDir::new(search_path).into_iter().filter_map(|e| e.ok()) {
            if entry.file_name().to_string_lossy() != soname {
                continue;
            }
            let candidate = entry.path();
            if is_valid_elf(candidate, arch) {
                cache.insert(arch, soname.to_string(), candidate.to_path_buf());
                return candidate.to_path_buf();
            }
        }
    }

    // Leave unresolved names as-is; the host may provide them.
    cache.insert(arch, soname.to_string(), soname_path.to_path_buf());
    soname_path.to_path_buf()
}

/// Parse every ELF file among `file_list` (relative to `root`). Object
/// files and symlinks are skipped, files that fail to parse are logged
/// and skipped, and only files with dynamic dependencies are returned.
/// The result is keyed (and therefore ordered) by path, so the closure
/// derived from it does not depend on input order.
pub fn get_elf_files(root: &Path, file_list: &[PathBuf]) -> BTreeMap<PathBuf, ElfFile> {
    let mut elf_files = BTreeMap::new();

    for part_file in file_list {
        if part_file.extension().map(|e| e == "o").unwrap_or(false) {
            continue;
        }
        let path = root.join(part_file);
        if path.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(true) {
            debug!("skipped link {:?} while finding dependencies", path);
            continue;
        }
        if !ElfFile::is_elf(&path) {
            continue;
        }
        match ElfFile::new(&path) {
            Ok(elf_file) => {
                if !elf_file.needed.is_empty() {
                    elf_files.insert(part_file.clone(), elf_file);
                }
            }
            Err(error) => {
                warn!("{}", error);
            }
        }
    }

    elf_files
}

/// Compare dotted numeric versions like `2.27` component-wise; missing
/// components count as zero.
pub(crate) fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.').map(|c| c.parse::<u64>().unwrap_or(0)).collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn ldd_output_parses_resolved_and_unresolved_lines() {
        let output = "\
\tlinux-vdso.so.1 (0x00007ffdc13ec000)
\tlibm.so.6 => /lib/x86_64-linux-gnu/libm.so.6 (0x00007fb3bef03000)
\tlibmissing.so.2 => not found
\t/lib64/ld-linux-x86-64.so.2 (0x00007fb3c5298000)
";
        let libraries = parse_ldd_output(output);
        assert_eq!(libraries.len(), 2);
        // The resolved path only survives when it exists on this host;
        // either way the soname is mapped.
        assert!(libraries.contains_key("libm.so.6"));
        assert_eq!(libraries["libmissing.so.2"], PathBuf::from("libmissing.so.2"));
    }

    #[test]
    fn vdso_and_linker_lines_are_ignored() {
        let output = "\tlinux-vdso.so.1 =>  (0x00007ffdc13ec000)\n";
        assert!(parse_ldd_output(output).is_empty());
    }

    #[test]
    fn version_comparison_is_numeric() {
        assert_eq!(compare_versions("2.9", "2.27"), Ordering::Less);
        assert_eq!(compare_versions("2.27", "2.27"), Ordering::Equal);
        assert_eq!(compare_versions("3", "2.27"), Ordering::Greater);
        assert_eq!(compare_versions("2.27", ""), Ordering::Greater);
    }

    #[test]
    fn non_elf_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        assert!(!ElfFile::is_elf(&path));
        assert!(!ElfFile::is_elf(&dir.path().join("missing")));
    }

    #[test]
    fn elf_magic_alone_is_not_a_parseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated");
        fs::write(&path, b"\x7fELF").unwrap();
        assert!(ElfFile::is_elf(&path));
        assert!(matches!(ElfFile::new(&path), Err(Error::CorruptedElf { .. })));
    }

    #[test]
    fn scan_skips_objects_links_and_non_elf() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("module.o"), b"\x7fELF").unwrap();
        fs::write(dir.path().join("readme"), b"text").unwrap();
        std::os::unix::fs::symlink("readme", dir.path().join("link")).unwrap();

        let files = vec![
            PathBuf::from("module.o"),
            PathBuf::from("readme"),
            PathBuf::from("link"),
        ];
        assert!(get_elf_files(dir.path(), &files).is_empty());
    }

    #[test]
    fn soname_cache_trims_to_root() {
        let arch = (2, 1, 62);
        let mut cache = SonameCache::default();
        cache.insert(arch, "libz.so.1".to_string(), PathBuf::from("/stage/usr/lib/libz.so.1"));
        cache.insert(arch, "libc.so.6".to_string(), PathBuf::from("/lib/libc.so.6"));

        cache.reset_except_root(Path::new("/stage"));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(arch, "libz.so.1").is_some());
        assert!(cache.get(arch, "libc.so.6").is_none());
    }
}
