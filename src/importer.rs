//! `@import` 的宿主接口。
//!
//! 求值器只通过 [`Importer`] 访问外部资源：解析路径、加载样式表、判断是否已导入过。
//! [`FileImporter`] 读取本地文件，[`MemoryImporter`] 用于测试和内嵌场景。

use crate::ast::Stylesheet;
use crate::error::{ErrorKind, LessError, LessResult};
use crate::parser::LessParser;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait Importer {
    /// 把 `@import` 中的路径解析成唯一路径。
    fn resolve_path(&mut self, target: &str, current_dir: Option<&Path>) -> LessResult<PathBuf>;

    fn load_source(&mut self, path: &Path) -> LessResult<Stylesheet>;

    /// 同一文件已经导入过时返回 true。
    fn should_suppress_import(&self, path: &Path) -> bool;

    fn record_import(&mut self, path: &Path);
}

/// 基于文件系统的导入器，按当前目录和 include 路径依次查找。
#[derive(Debug, Default)]
pub struct FileImporter {
    parser: LessParser,
    include_paths: Vec<PathBuf>,
    sources: HashMap<PathBuf, String>,
    imported: HashSet<PathBuf>,
}

impl FileImporter {
    pub fn new(include_paths: &[PathBuf]) -> Self {
        Self {
            parser: LessParser::new(),
            include_paths: include_paths.to_vec(),
            sources: HashMap::new(),
            imported: HashSet::new(),
        }
    }

    fn find_existing(candidate: &Path) -> Option<PathBuf> {
        let mut attempts = vec![candidate.to_path_buf()];
        if candidate.extension().is_none() {
            attempts.push(candidate.with_extension("less"));
        }
        for attempt in attempts {
            if attempt.is_file() {
                if let Ok(real) = attempt.canonicalize() {
                    return Some(real);
                }
                return Some(attempt);
            }
        }
        None
    }
}

impl Importer for FileImporter {
    fn resolve_path(&mut self, target: &str, current_dir: Option<&Path>) -> LessResult<PathBuf> {
        let raw = Path::new(target);
        let mut candidates = Vec::new();
        if raw.is_absolute() {
            candidates.push(raw.to_path_buf());
        } else {
            if let Some(dir) = current_dir {
                candidates.push(dir.join(raw));
            }
            for base in &self.include_paths {
                candidates.push(base.join(raw));
            }
            if current_dir.is_none() {
                candidates.push(raw.to_path_buf());
            }
        }
        for candidate in candidates {
            if let Some(found) = Self::find_existing(&candidate) {
                debug!(target = target, resolved = %found.display(), "解析 @import 路径");
                return Ok(found);
            }
        }
        Err(LessError::kind(
            ErrorKind::Import,
            format!("无法解析 @import 路径 {target}"),
        ))
    }

    fn load_source(&mut self, path: &Path) -> LessResult<Stylesheet> {
        if !self.sources.contains_key(path) {
            let content = fs::read_to_string(path).map_err(|err| {
                LessError::kind(
                    ErrorKind::Import,
                    format!("读取文件 {} 失败: {err}", path.display()),
                )
            })?;
            self.sources.insert(path.to_path_buf(), content);
        }
        let content = self.sources.get(path).map(String::as_str).unwrap_or_default();
        self.parser
            .parse(content)
            .map_err(|err| attach_path(err, path))
    }

    fn should_suppress_import(&self, path: &Path) -> bool {
        self.imported.contains(path)
    }

    fn record_import(&mut self, path: &Path) {
        self.imported.insert(path.to_path_buf());
    }
}

/// 内存中的导入器，路径即文件名。
#[derive(Debug, Default)]
pub struct MemoryImporter {
    parser: LessParser,
    files: HashMap<PathBuf, String>,
    imported: HashSet<PathBuf>,
}

impl MemoryImporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        self.files.insert(name.into(), source.into());
        self
    }

    pub fn imported(&self) -> usize {
        self.imported.len()
    }
}

impl Importer for MemoryImporter {
    fn resolve_path(&mut self, target: &str, current_dir: Option<&Path>) -> LessResult<PathBuf> {
        let raw = Path::new(target);
        let mut candidates = Vec::new();
        if let Some(dir) = current_dir {
            candidates.push(dir.join(raw));
        }
        candidates.push(raw.to_path_buf());
        for candidate in candidates {
            if self.files.contains_key(&candidate) {
                return Ok(candidate);
            }
            let with_ext = candidate.with_extension("less");
            if candidate.extension().is_none() && self.files.contains_key(&with_ext) {
                return Ok(with_ext);
            }
        }
        Err(LessError::kind(
            ErrorKind::Import,
            format!("无法解析 @import 路径 {target}"),
        ))
    }

    fn load_source(&mut self, path: &Path) -> LessResult<Stylesheet> {
        let source = self.files.get(path).ok_or_else(|| {
            LessError::kind(
                ErrorKind::Import,
                format!("找不到文件 {}", path.display()),
            )
        })?;
        self.parser
            .parse(source)
            .map_err(|err| attach_path(err, path))
    }

    fn should_suppress_import(&self, path: &Path) -> bool {
        self.imported.contains(path)
    }

    fn record_import(&mut self, path: &Path) {
        self.imported.insert(path.to_path_buf());
    }
}

fn attach_path(err: LessError, path: &Path) -> LessError {
    match err {
        LessError::ParseError { message, position } => LessError::ParseError {
            message: format!("{message} (文件: {})", path.display()),
            position,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn memory_importer_probes_less_extension() {
        let mut importer = MemoryImporter::new().with_file("vars.less", "@a: 1;");
        let path = importer.resolve_path("vars", None).unwrap();
        assert_eq!(path, PathBuf::from("vars.less"));
        assert_eq!(importer.load_source(&path).unwrap().block.len(), 1);
        assert!(!importer.should_suppress_import(&path));
        importer.record_import(&path);
        assert!(importer.should_suppress_import(&path));
    }

    #[test]
    fn missing_file_is_import_error() {
        let mut importer = MemoryImporter::new();
        let err = importer.resolve_path("nope.less", None).unwrap_err();
        assert_eq!(err.error_kind(), Some(ErrorKind::Import));
    }

    #[test]
    fn parse_errors_carry_file_name() {
        let mut importer = MemoryImporter::new().with_file("bad.less", ".a {");
        let err = importer.load_source(Path::new("bad.less")).unwrap_err();
        assert!(err.to_string().contains("bad.less"));
    }

    #[test]
    fn file_importer_reads_from_include_paths() {
        let dir = env::temp_dir().join(format!("less_forge_import_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("theme.less"), "@brand: #333;").unwrap();
        let mut importer = FileImporter::new(&[dir.clone()]);
        let path = importer.resolve_path("theme", None).unwrap();
        assert!(path.ends_with("theme.less"));
        assert_eq!(importer.load_source(&path).unwrap().block.len(), 1);
        fs::remove_dir_all(&dir).unwrap();
    }
}
