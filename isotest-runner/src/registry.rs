// Copyright (c) The isotest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The explicit registry of test assemblies, classes and methods.
//!
//! Rust has no runtime reflection, so the embedding application describes its tests up front. The
//! same registry is built in the host and in every worker process; a case is then identified by
//! plain names (assembly, class, method) and resolved against whichever copy of the registry is
//! loaded in the current execution context.
//!
//! A test class is any `'static` type. It is constructed once per case, preferring a constructor
//! that accepts a [`TestOutput`] and falling back to one that takes no arguments.

use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{any::Any, error, fmt, sync::Arc};

/// An error returned by test code: a constructor, a method or a session hook.
pub type MethodError = Box<dyn error::Error + Send + Sync>;

/// The result of running test code.
pub type MethodResult = Result<(), MethodError>;

/// The output-logging capability handed to test classes.
///
/// Every line written here is attributed to the case currently running and reported alongside
/// its outcome.
#[derive(Clone)]
pub struct TestOutput {
    sink: Arc<dyn Fn(&str) + Send + Sync>,
}

impl TestOutput {
    /// Creates an output handle that forwards each line to `sink`.
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Creates an output handle that drops everything written to it.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Writes a line of output.
    pub fn write_line(&self, line: impl AsRef<str>) {
        (self.sink)(line.as_ref())
    }
}

impl fmt::Debug for TestOutput {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TestOutput").finish_non_exhaustive()
    }
}

/// Decodes the argument at `index` into `T`.
pub fn argument<T: DeserializeOwned>(arguments: &[Value], index: usize) -> Result<T, MethodError> {
    let value = arguments
        .get(index)
        .ok_or_else(|| format!("missing argument {index} (got {})", arguments.len()))?;
    Ok(T::deserialize(value)?)
}

/// A per-case hook around test class construction and method invocation.
///
/// Sessions are how an embedding application bootstraps frameworks with global state (a UI
/// toolkit, for example) inside the execution context a case runs in.
pub trait Session {
    /// Called before the test class is constructed.
    fn on_creating_test_class(&mut self) -> MethodResult {
        Ok(())
    }

    /// Runs the test method. Implementations may do work before and after calling `invoke`, such
    /// as pumping an event queue.
    fn on_run_test_method(&mut self, invoke: &mut dyn FnMut() -> MethodResult) -> MethodResult {
        invoke()
    }
}

/// Creates a [`Session`] for each case of an assembly.
pub trait SessionCallbacks: Send + Sync {
    /// Creates the session for one case.
    fn create_session(
        &self,
        class: &str,
        method: &str,
        arguments: &[Value],
        output: &TestOutput,
    ) -> Box<dyn Session>;
}

type OutputConstructor<T> = Box<dyn Fn(TestOutput) -> Result<T, MethodError> + Send + Sync>;
type DefaultConstructor<T> = Box<dyn Fn() -> Result<T, MethodError> + Send + Sync>;
type Method<T> = Box<dyn Fn(&mut T, &[Value]) -> MethodResult + Send + Sync>;

/// The definition of a test class of type `T`.
pub struct TestClassDef<T> {
    name: String,
    output_constructor: Option<OutputConstructor<T>>,
    default_constructor: Option<DefaultConstructor<T>>,
    methods: IndexMap<String, Method<T>>,
}

impl<T: 'static> TestClassDef<T> {
    /// Starts a definition for the class with the given fully qualified name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output_constructor: None,
            default_constructor: None,
            methods: IndexMap::new(),
        }
    }

    /// Sets the constructor that receives the case's output handle.
    pub fn with_output_constructor(
        self,
        constructor: impl Fn(TestOutput) -> T + Send + Sync + 'static,
    ) -> Self {
        self.try_with_output_constructor(move |output| Ok(constructor(output)))
    }

    /// Sets a fallible constructor that receives the case's output handle.
    pub fn try_with_output_constructor(
        mut self,
        constructor: impl Fn(TestOutput) -> Result<T, MethodError> + Send + Sync + 'static,
    ) -> Self {
        self.output_constructor = Some(Box::new(constructor));
        self
    }

    /// Sets the no-argument constructor.
    pub fn with_default_constructor(
        self,
        constructor: impl Fn() -> T + Send + Sync + 'static,
    ) -> Self {
        self.try_with_default_constructor(move || Ok(constructor()))
    }

    /// Sets a fallible no-argument constructor.
    pub fn try_with_default_constructor(
        mut self,
        constructor: impl Fn() -> Result<T, MethodError> + Send + Sync + 'static,
    ) -> Self {
        self.default_constructor = Some(Box::new(constructor));
        self
    }

    /// Adds a test method.
    pub fn method(
        mut self,
        name: impl Into<String>,
        method: impl Fn(&mut T, &[Value]) -> MethodResult + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Box::new(method));
        self
    }
}

impl<T> fmt::Debug for TestClassDef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TestClassDef")
            .field("name", &self.name)
            .field("output_constructor", &self.output_constructor.is_some())
            .field("default_constructor", &self.default_constructor.is_some())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A type-erased test class, as stored in an assembly.
pub(crate) trait ClassEntry: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Constructs an instance, or returns `None` if no constructor is defined.
    fn construct(&self, output: &TestOutput) -> Option<Result<Box<dyn Any>, MethodError>>;

    fn has_method(&self, method: &str) -> bool;

    fn invoke(&self, instance: &mut dyn Any, method: &str, arguments: &[Value]) -> MethodResult;
}

impl<T: 'static> ClassEntry for TestClassDef<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn construct(&self, output: &TestOutput) -> Option<Result<Box<dyn Any>, MethodError>> {
        let instance = match (&self.output_constructor, &self.default_constructor) {
            (Some(constructor), _) => constructor(output.clone()),
            (None, Some(constructor)) => constructor(),
            (None, None) => return None,
        };
        Some(instance.map(|instance| Box::new(instance) as Box<dyn Any>))
    }

    fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    fn invoke(&self, instance: &mut dyn Any, method: &str, arguments: &[Value]) -> MethodResult {
        let method = self
            .methods
            .get(method)
            .ok_or_else(|| format!("method `{method}` not found on `{}`", self.name))?;
        let instance = instance
            .downcast_mut::<T>()
            .ok_or_else(|| format!("instance is not a `{}`", self.name))?;
        method(instance, arguments)
    }
}

/// A named group of test classes, with optional session callbacks.
#[derive(Debug)]
pub struct TestAssembly {
    name: String,
    classes: IndexMap<String, Box<dyn ClassEntry>>,
    session_callbacks: Option<DebugIgnore<Arc<dyn SessionCallbacks>>>,
}

impl TestAssembly {
    /// Creates an empty assembly.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: IndexMap::new(),
            session_callbacks: None,
        }
    }

    /// Adds a class. A class with the same name is replaced.
    pub fn class<T: 'static>(mut self, class: TestClassDef<T>) -> Self {
        self.classes.insert(class.name.clone(), Box::new(class));
        self
    }

    /// Declares the session callbacks used for every case in this assembly.
    pub fn with_session_callbacks(mut self, callbacks: impl SessionCallbacks + 'static) -> Self {
        self.session_callbacks = Some(DebugIgnore(Arc::new(callbacks)));
        self
    }

    /// The assembly's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterates over the names of the classes in this assembly, in registration order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub(crate) fn get_class(&self, name: &str) -> Option<&dyn ClassEntry> {
        self.classes.get(name).map(|class| &**class)
    }

    pub(crate) fn session_callbacks(&self) -> Option<&dyn SessionCallbacks> {
        self.session_callbacks.as_ref().map(|callbacks| &***callbacks)
    }
}

/// All the assemblies known to a process.
#[derive(Debug, Default)]
pub struct TestRegistry {
    assemblies: IndexMap<String, TestAssembly>,
}

impl TestRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an assembly. An assembly with the same name is replaced.
    pub fn assembly(mut self, assembly: TestAssembly) -> Self {
        self.assemblies.insert(assembly.name.clone(), assembly);
        self
    }

    /// Looks up an assembly by name.
    pub fn get(&self, name: &str) -> Option<&TestAssembly> {
        self.assemblies.get(name)
    }
}
