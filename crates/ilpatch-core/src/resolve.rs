//! Module loading and symbol resolution.
//!
//! Dependency modules are located lazily: [`DirectoryResolver`] only indexes
//! the directories that contain module files and reads a dependency the first
//! time a symbol inside it is requested. A dependency that cannot be found
//! surfaces as [`Error::UnresolvedSymbol`] at patch time, never at load time.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::module::{MODULE_EXTENSION, MemberRef, Module, read_module};

/// Symbolic reference to a field or method.
///
/// `scope` names the defining module (`None` means the module being patched);
/// `params`, when given, selects an overload by exact parameter types.
/// Serialized in its text form, see the [`FromStr`] impl.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SymbolQuery {
    pub scope: Option<String>,
    pub type_name: String,
    pub name: String,
    pub params: Option<Vec<String>>,
}

impl SymbolQuery {
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: None,
            type_name: type_name.into(),
            name: name.into(),
            params: None,
        }
    }

    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    /// Match an already-resolved member without looking anything up.
    pub fn matches(&self, member: &MemberRef) -> bool {
        self.type_name == member.declaring_type
            && self.name == member.name
            && self.scope.as_ref().is_none_or(|scope| *scope == member.scope)
            && self
                .params
                .as_ref()
                .is_none_or(|params| *params == member.signature.params)
    }
}

impl fmt::Display for SymbolQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scope) = &self.scope {
            write!(f, "[{}]", scope)?;
        }
        write!(f, "{}::{}", self.type_name, self.name)?;
        if let Some(params) = &self.params {
            write!(f, "({})", params.join(", "))?;
        }
        Ok(())
    }
}

/// Parses `[scope]Type::Member(params)`; scope and params are optional and
/// `Type.Member` is accepted as well.
impl FromStr for SymbolQuery {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPatch(format!("Invalid symbol '{}'", s));
        let mut rest = s.trim();

        let mut scope = None;
        if let Some(stripped) = rest.strip_prefix('[') {
            let (name, tail) = stripped.split_once(']').ok_or_else(invalid)?;
            scope = Some(name.trim().to_string());
            rest = tail;
        }

        let mut params = None;
        if let Some(open) = rest.find('(') {
            let inner = rest[open + 1..].strip_suffix(')').ok_or_else(invalid)?;
            params = Some(
                inner
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
            rest = &rest[..open];
        }

        let (type_name, name) = rest
            .split_once("::")
            .or_else(|| rest.rsplit_once('.'))
            .ok_or_else(invalid)?;
        if type_name.is_empty() || name.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scope,
            type_name: type_name.to_string(),
            name: name.to_string(),
            params,
        })
    }
}

impl TryFrom<String> for SymbolQuery {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SymbolQuery> for String {
    fn from(query: SymbolQuery) -> Self {
        query.to_string()
    }
}

/// Source of dependency modules.
pub trait SymbolResolver {
    /// Look up a module by name, `Ok(None)` when no such module is reachable.
    fn resolve_module(&self, name: &str) -> Result<Option<Rc<Module>>>;

    /// Like [`SymbolResolver::resolve_module`], but an unreachable module is
    /// an [`Error::UnresolvedSymbol`] naming `symbol`.
    fn require_module(&self, name: &str, symbol: &str) -> Result<Rc<Module>> {
        self.resolve_module(name)?
            .ok_or_else(|| Error::UnresolvedSymbol {
                symbol: symbol.to_string(),
                reason: format!("module {} could not be located", name),
            })
    }

    fn resolve_method(&self, query: &SymbolQuery) -> Result<MemberRef> {
        let module = self.require_module(required_scope(query)?, &query.to_string())?;
        method_ref(&module, query)
    }

    fn resolve_field(&self, query: &SymbolQuery) -> Result<MemberRef> {
        let module = self.require_module(required_scope(query)?, &query.to_string())?;
        field_ref(&module, query)
    }
}

fn required_scope(query: &SymbolQuery) -> Result<&str> {
    query.scope.as_deref().ok_or_else(|| Error::UnresolvedSymbol {
        symbol: query.to_string(),
        reason: "no defining module given".to_string(),
    })
}

fn method_ref(module: &Module, query: &SymbolQuery) -> Result<MemberRef> {
    let ty = module.find_type(&query.type_name)?;
    let method = match &query.params {
        Some(params) => ty.find_overload(&query.name, params)?,
        None => ty.find_method(&query.name)?,
    };
    Ok(method.to_ref(&module.name, &ty.full_name))
}

fn field_ref(module: &Module, query: &SymbolQuery) -> Result<MemberRef> {
    let ty = module.find_type(&query.type_name)?;
    Ok(ty.find_field(&query.name)?.to_ref(&module.name, &ty.full_name))
}

/// Resolves symbols for one module being patched.
///
/// Queries without a scope, or scoped to the module itself, are looked up
/// locally; everything else goes through the resolver.
pub struct SymbolContext<'a> {
    module: &'a Module,
    resolver: &'a dyn SymbolResolver,
}

impl<'a> SymbolContext<'a> {
    pub fn new(module: &'a Module, resolver: &'a dyn SymbolResolver) -> Self {
        Self { module, resolver }
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn resolve_method(&self, query: &SymbolQuery) -> Result<MemberRef> {
        if self.is_local(query) {
            method_ref(self.module, query)
        } else {
            self.resolver.resolve_method(query)
        }
    }

    pub fn resolve_field(&self, query: &SymbolQuery) -> Result<MemberRef> {
        if self.is_local(query) {
            field_ref(self.module, query)
        } else {
            self.resolver.resolve_field(query)
        }
    }

    fn is_local(&self, query: &SymbolQuery) -> bool {
        query
            .scope
            .as_deref()
            .is_none_or(|scope| scope == self.module.name)
    }
}

/// Resolver over modules already in memory.
#[derive(Debug, Default)]
pub struct StaticResolver {
    modules: HashMap<String, Rc<Module>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.insert(module.name.clone(), Rc::new(module));
        self
    }
}

impl SymbolResolver for StaticResolver {
    fn resolve_module(&self, name: &str) -> Result<Option<Rc<Module>>> {
        Ok(self.modules.get(name).cloned())
    }
}

/// Resolver over module files below a set of search roots.
#[derive(Debug)]
pub struct DirectoryResolver {
    directories: Vec<PathBuf>,
    cache: RefCell<HashMap<String, Rc<Module>>>,
}

impl DirectoryResolver {
    /// Index every directory below `roots` that holds at least one module file.
    pub fn new<P: AsRef<Path>>(roots: &[P]) -> Result<Self> {
        let mut directories = Vec::new();
        for root in roots {
            let root = root.as_ref();
            if !root.is_dir() {
                warn!("Search directory {} does not exist, skipping", root.display());
                continue;
            }
            collect_module_directories(root, &mut directories)?;
        }
        debug!("Indexed {} dependency directories", directories.len());

        Ok(Self {
            directories,
            cache: RefCell::new(HashMap::new()),
        })
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    fn find_module_file(&self, name: &str) -> Option<PathBuf> {
        let file_name = format!("{}.{}", name, MODULE_EXTENSION);
        self.directories
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }
}

impl SymbolResolver for DirectoryResolver {
    fn resolve_module(&self, name: &str) -> Result<Option<Rc<Module>>> {
        if let Some(module) = self.cache.borrow().get(name) {
            return Ok(Some(Rc::clone(module)));
        }

        let Some(path) = self.find_module_file(name) else {
            debug!("Module {} not found in search directories", name);
            return Ok(None);
        };

        let module = read_module(&path)?;
        if module.name != name {
            warn!(
                "Module file {} declares name {}, expected {}",
                path.display(),
                module.name,
                name
            );
        }
        debug!("Resolved module {} from {}", name, path.display());

        let module = Rc::new(module);
        self.cache
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&module));
        Ok(Some(module))
    }
}

fn collect_module_directories(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut has_module = false;
    let mut children = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            children.push(path);
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(MODULE_EXTENSION))
        {
            has_module = true;
        }
    }

    if has_module && !out.iter().any(|d| d == dir) {
        out.push(dir.to_path_buf());
    }

    children.sort();
    for child in children {
        collect_module_directories(&child, out)?;
    }
    Ok(())
}

/// A module read from disk together with the resolver for its dependencies.
#[derive(Debug)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub module: Module,
    pub resolver: DirectoryResolver,
}

/// Read the module at `path` and index `search_dirs` for its dependencies.
///
/// The module's own directory is always searched first.
pub fn load_module<P: AsRef<Path>>(path: P, search_dirs: &[PathBuf]) -> Result<LoadedModule> {
    let path = path.as_ref();
    let module = read_module(path)?;

    let mut roots: Vec<PathBuf> = Vec::with_capacity(search_dirs.len() + 1);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        roots.push(parent.to_path_buf());
    }
    roots.extend(search_dirs.iter().cloned());

    let resolver = DirectoryResolver::new(&roots)?;
    Ok(LoadedModule {
        path: path.to_path_buf(),
        module,
        resolver,
    })
}
