//! Data model interface and the built-in data models.
//!
//! A data model owns the variable bindings of one session. The interpreter
//! mutates it only from the stepping context.

use crate::error::DataModelError;
use statecraft_core::{codec, Data, Event, Expr, Path, Scope, Script};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Bindings documents may read but never assign.
pub const RESERVED_BINDINGS: [&str; 5] =
    ["_sessionid", "_name", "_ioprocessors", "_invokers", "_event"];

const EXPR_CACHE_LIMIT: usize = 4096;

/// A named value provided by the embedding application.
pub trait DataModelExtension: Send + Sync {
    /// Current value, read before every evaluation.
    fn value(&self) -> Data;
}

impl<F> DataModelExtension for F
where
    F: Fn() -> Data + Send + Sync,
{
    fn value(&self) -> Data {
        self()
    }
}

/// Variable bindings and expression evaluation for one session.
pub trait DataModel: Send {
    /// Name under which the data model is registered.
    fn name(&self) -> &str;

    /// Executes a script.
    fn eval(&mut self, script: &str) -> Result<(), DataModelError>;

    /// Evaluates a condition.
    fn eval_as_bool(&mut self, expr: &str) -> Result<bool, DataModelError>;

    /// Evaluates a value expression.
    fn eval_as_data(&mut self, expr: &str) -> Result<Data, DataModelError>;

    /// Converts literal content to a value.
    fn get_as_data(&mut self, content: &str) -> Result<Data, DataModelError>;

    /// Assigns to a declared location. Reserved bindings are rejected and the
    /// data model is left unmodified on any error.
    ///
    /// `attrs` carries assignment options; `mode = "merge"` merges the value
    /// into the current one instead of replacing it.
    fn assign(
        &mut self,
        location: &str,
        data: Data,
        attrs: &BTreeMap<String, String>,
    ) -> Result<(), DataModelError>;

    /// Declares (or re-initializes) a top-level variable.
    fn declare(&mut self, id: &str, data: Data) -> Result<(), DataModelError>;

    /// Current value of a top-level variable, `None` if unbound.
    fn binding(&self, id: &str) -> Option<Data>;

    /// Rebinds a top-level variable, or unbinds it for `None`.
    fn restore_binding(&mut self, id: &str, value: Option<Data>);

    /// Length of an array valued expression.
    fn get_length(&mut self, expr: &str) -> Result<usize, DataModelError>;

    /// Binds `item` (and `index`) to element `iteration` of `array`.
    fn set_foreach(
        &mut self,
        item: &str,
        array: &str,
        index: Option<&str>,
        iteration: usize,
    ) -> Result<(), DataModelError>;

    fn is_valid_expr_syntax(&self, expr: &str) -> bool;

    fn is_valid_script_syntax(&self, script: &str) -> bool;

    /// Makes `event` visible as `_event`.
    fn set_event(&mut self, event: &Event);

    /// Sets a read-only system binding such as `_sessionid`.
    fn set_system(&mut self, id: &str, value: Data);

    /// Ids of the active states, for `In()`.
    fn set_active_states(&mut self, ids: BTreeSet<String>);

    fn add_extension(
        &mut self,
        name: &str,
        extension: Arc<dyn DataModelExtension>,
    ) -> Result<(), DataModelError>;

    /// User bindings as one compound value.
    fn snapshot(&self) -> Data;

    /// Replaces user bindings with a snapshot.
    fn restore(&mut self, snapshot: &Data) -> Result<(), DataModelError>;
}

fn parse_location(location: &str) -> Result<Path, DataModelError> {
    Path::parse(location).map_err(|e| DataModelError::from_core(location, e))
}

/// The `"expr"` data model.
#[derive(Default)]
pub struct ExprDataModel {
    vars: BTreeMap<String, Data>,
    system: BTreeMap<String, Data>,
    extensions: BTreeMap<String, Arc<dyn DataModelExtension>>,
    extension_values: BTreeMap<String, Data>,
    active: BTreeSet<String>,
    exprs: HashMap<String, Expr>,
}

impl Scope for ExprDataModel {
    fn variable(&self, name: &str) -> Option<&Data> {
        self.system
            .get(name)
            .or_else(|| self.vars.get(name))
            .or_else(|| self.extension_values.get(name))
    }

    fn in_state(&self, id: &str) -> bool {
        self.active.contains(id)
    }
}

impl ExprDataModel {
    pub fn new() -> Self {
        let mut system = BTreeMap::new();
        system.insert("_x".to_string(), Data::compound());
        Self {
            system,
            ..Default::default()
        }
    }

    fn is_protected(&self, root: &str) -> bool {
        RESERVED_BINDINGS.contains(&root)
            || self.system.contains_key(root)
            || self.extensions.contains_key(root)
    }

    fn refresh_extensions(&mut self) {
        for (name, extension) in &self.extensions {
            self.extension_values.insert(name.clone(), extension.value());
        }
    }

    fn compile(&mut self, expr: &str) -> Result<(), DataModelError> {
        if self.exprs.contains_key(expr) {
            return Ok(());
        }
        let parsed = Expr::parse(expr).map_err(|e| DataModelError::from_core(expr, e))?;
        if self.exprs.len() >= EXPR_CACHE_LIMIT {
            self.exprs.clear();
        }
        self.exprs.insert(expr.to_string(), parsed);
        Ok(())
    }

    /// Writes along `path`. The new root value is built on a copy so a failed
    /// write changes nothing.
    fn write(&mut self, path: &Path, value: Data, must_exist: bool) -> Result<(), DataModelError> {
        if self.is_protected(&path.root) {
            return Err(DataModelError::Reserved {
                location: path.to_string(),
            });
        }
        if must_exist && !self.vars.contains_key(&path.root) {
            return Err(DataModelError::execution(format!(
                "'{}' is not declared",
                path.root
            )));
        }

        let mut root = self.vars.get(&path.root).cloned().unwrap_or_default();
        path.assign_into(&mut root, value)
            .map_err(|e| DataModelError::from_core(&path.to_string(), e))?;
        self.vars.insert(path.root.clone(), root);
        Ok(())
    }
}

impl DataModel for ExprDataModel {
    fn name(&self) -> &str {
        "expr"
    }

    fn eval(&mut self, script: &str) -> Result<(), DataModelError> {
        let parsed = Script::parse(script).map_err(|e| DataModelError::from_core(script, e))?;
        self.refresh_extensions();
        for statement in parsed.statements {
            let value = statement
                .value
                .evaluate(&*self)
                .map_err(|e| DataModelError::from_core(script, e))?;
            self.write(&statement.location, value, false)?;
        }
        Ok(())
    }

    fn eval_as_bool(&mut self, expr: &str) -> Result<bool, DataModelError> {
        Ok(self.eval_as_data(expr)?.is_truthy())
    }

    fn eval_as_data(&mut self, expr: &str) -> Result<Data, DataModelError> {
        self.compile(expr)?;
        self.refresh_extensions();
        let parsed = &self.exprs[expr];
        parsed
            .evaluate(&*self)
            .map_err(|e| DataModelError::from_core(expr, e))
    }

    fn get_as_data(&mut self, content: &str) -> Result<Data, DataModelError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(Data::Undefined);
        }
        Ok(codec::decode(trimmed).unwrap_or_else(|_| Data::verbatim(trimmed)))
    }

    fn assign(
        &mut self,
        location: &str,
        data: Data,
        attrs: &BTreeMap<String, String>,
    ) -> Result<(), DataModelError> {
        let path = parse_location(location)?;
        let value = match attrs.get("mode").map(String::as_str) {
            None | Some("replace") => data,
            Some("merge") => {
                let mut current = path.lookup(&*self).unwrap_or_default();
                current.merge(&data);
                current
            }
            Some(other) => {
                return Err(DataModelError::execution(format!(
                    "unknown assignment mode '{}'",
                    other
                )))
            }
        };
        self.write(&path, value, true)
    }

    fn declare(&mut self, id: &str, data: Data) -> Result<(), DataModelError> {
        let path = parse_location(id)?;
        if !path.segments.is_empty() {
            return Err(DataModelError::execution(format!(
                "'{}' is not a variable name",
                id
            )));
        }
        self.write(&path, data, false)
    }

    fn binding(&self, id: &str) -> Option<Data> {
        self.vars.get(id).cloned()
    }

    fn restore_binding(&mut self, id: &str, value: Option<Data>) {
        match value {
            Some(value) => {
                self.vars.insert(id.to_string(), value);
            }
            None => {
                self.vars.remove(id);
            }
        }
    }

    fn get_length(&mut self, expr: &str) -> Result<usize, DataModelError> {
        self.eval_as_data(expr)?
            .len()
            .ok_or_else(|| DataModelError::execution(format!("'{}' is not an array", expr)))
    }

    fn set_foreach(
        &mut self,
        item: &str,
        array: &str,
        index: Option<&str>,
        iteration: usize,
    ) -> Result<(), DataModelError> {
        let items = self.eval_as_data(array)?;
        let element = items.get_index(iteration).cloned().ok_or_else(|| {
            DataModelError::execution(format!("'{}' has no element {}", array, iteration))
        })?;

        let item_path = parse_location(item)?;
        self.write(&item_path, element, false)?;
        if let Some(index) = index {
            let index_path = parse_location(index)?;
            self.write(&index_path, Data::from(iteration), false)?;
        }
        Ok(())
    }

    fn is_valid_expr_syntax(&self, expr: &str) -> bool {
        Expr::parse(expr).is_ok()
    }

    fn is_valid_script_syntax(&self, script: &str) -> bool {
        Script::parse(script).is_ok()
    }

    fn set_event(&mut self, event: &Event) {
        self.system.insert("_event".to_string(), event.to_data());
    }

    fn set_system(&mut self, id: &str, value: Data) {
        self.system.insert(id.to_string(), value);
    }

    fn set_active_states(&mut self, ids: BTreeSet<String>) {
        self.active = ids;
    }

    fn add_extension(
        &mut self,
        name: &str,
        extension: Arc<dyn DataModelExtension>,
    ) -> Result<(), DataModelError> {
        let rejected = |reason: &str| DataModelError::Extension {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        match Path::parse(name) {
            Ok(path) if path.segments.is_empty() => {}
            _ => return Err(rejected("not a variable name")),
        }
        if self.is_protected(name) || self.vars.contains_key(name) {
            return Err(rejected("name already bound"));
        }

        self.extension_values
            .insert(name.to_string(), extension.value());
        self.extensions.insert(name.to_string(), extension);
        Ok(())
    }

    fn snapshot(&self) -> Data {
        Data::Compound(self.vars.clone())
    }

    fn restore(&mut self, snapshot: &Data) -> Result<(), DataModelError> {
        match snapshot {
            Data::Compound(vars) => self.vars = vars.clone(),
            Data::Undefined => self.vars.clear(),
            other => {
                return Err(DataModelError::execution(format!(
                    "cannot restore bindings from {}",
                    other
                )))
            }
        }
        Ok(())
    }
}

/// The `"null"` data model: no variables, conditions limited to `In()`.
#[derive(Default)]
pub struct NullDataModel {
    active: BTreeSet<String>,
}

impl Scope for NullDataModel {
    fn variable(&self, _name: &str) -> Option<&Data> {
        None
    }

    fn in_state(&self, id: &str) -> bool {
        self.active.contains(id)
    }
}

impl NullDataModel {
    fn unsupported(what: &str) -> DataModelError {
        DataModelError::execution(format!("the null data model does not support {}", what))
    }
}

impl DataModel for NullDataModel {
    fn name(&self) -> &str {
        "null"
    }

    fn eval(&mut self, _script: &str) -> Result<(), DataModelError> {
        Err(Self::unsupported("scripts"))
    }

    fn eval_as_bool(&mut self, expr: &str) -> Result<bool, DataModelError> {
        let parsed = Expr::parse(expr).map_err(|e| DataModelError::from_core(expr, e))?;
        parsed
            .evaluate_bool(&*self)
            .map_err(|e| DataModelError::from_core(expr, e))
    }

    fn eval_as_data(&mut self, _expr: &str) -> Result<Data, DataModelError> {
        Err(Self::unsupported("value expressions"))
    }

    fn get_as_data(&mut self, content: &str) -> Result<Data, DataModelError> {
        Ok(Data::verbatim(content.trim()))
    }

    fn assign(
        &mut self,
        _location: &str,
        _data: Data,
        _attrs: &BTreeMap<String, String>,
    ) -> Result<(), DataModelError> {
        Err(Self::unsupported("assignment"))
    }

    fn declare(&mut self, _id: &str, _data: Data) -> Result<(), DataModelError> {
        Err(Self::unsupported("data declarations"))
    }

    fn binding(&self, _id: &str) -> Option<Data> {
        None
    }

    fn restore_binding(&mut self, _id: &str, _value: Option<Data>) {}

    fn get_length(&mut self, _expr: &str) -> Result<usize, DataModelError> {
        Err(Self::unsupported("foreach"))
    }

    fn set_foreach(
        &mut self,
        _item: &str,
        _array: &str,
        _index: Option<&str>,
        _iteration: usize,
    ) -> Result<(), DataModelError> {
        Err(Self::unsupported("foreach"))
    }

    fn is_valid_expr_syntax(&self, expr: &str) -> bool {
        Expr::parse(expr).is_ok()
    }

    fn is_valid_script_syntax(&self, _script: &str) -> bool {
        false
    }

    fn set_event(&mut self, _event: &Event) {}

    fn set_system(&mut self, _id: &str, _value: Data) {}

    fn set_active_states(&mut self, ids: BTreeSet<String>) {
        self.active = ids;
    }

    fn add_extension(
        &mut self,
        name: &str,
        _extension: Arc<dyn DataModelExtension>,
    ) -> Result<(), DataModelError> {
        Err(DataModelError::Extension {
            name: name.to_string(),
            reason: "the null data model has no bindings".to_string(),
        })
    }

    fn snapshot(&self) -> Data {
        Data::Undefined
    }

    fn restore(&mut self, _snapshot: &Data) -> Result<(), DataModelError> {
        Ok(())
    }
}
