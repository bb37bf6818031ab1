// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    fmt::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use fxhash::FxHashSet;
use islet_utils::error::JsError;

use crate::{
    engine::{Engine, EngineError, EngineValue, NativeCallback},
    instances::InstanceRegistry,
    value::{HostFuture, HostValue},
};

/// Guest-side prelude every generated class leans on: the shared
/// instance-id WeakMap, the error-prefix decoder, and the wrapper table
/// used to hand out instances from host return values.
const PRELUDE: &str = r#"(() => {
  if (globalThis.__islet) { return; }
  const ids = new WeakMap();
  const skip = Symbol("islet.skip");
  const wrappers = {};
  const ctors = { Error, TypeError, RangeError, SyntaxError, ReferenceError, URIError, EvalError };
  const err = (e) => {
    const msg = typeof e === "string" ? e : e && e.message !== undefined ? String(e.message) : String(e);
    const match = /^\[([A-Za-z]+)\]([\s\S]*)$/.exec(msg);
    if (!match) { return e instanceof Error ? e : new Error(msg); }
    const Ctor = ctors[match[1]] || Error;
    return new Ctor(match[2]);
  };
  const wrap = (v) => {
    if (v && typeof v === "object" && typeof v.__wrapClass === "string" && wrappers[v.__wrapClass]) {
      return wrappers[v.__wrapClass](v.__wrapId);
    }
    return v;
  };
  const unwrapArg = (a) => {
    if (a !== null && typeof a === "object" && ids.has(a)) {
      return { __instanceRef: ids.get(a) };
    }
    return a;
  };
  globalThis.__islet = {
    ids, skip, wrappers, err, wrap, unwrapArg,
    call(fn, args) { try { return wrap(fn(...args.map(unwrapArg))); } catch (e) { throw err(e); } },
    async acall(fn, args) { try { return wrap(await fn(...args.map(unwrapArg))); } catch (e) { throw err(e); } },
  };
})();
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    Sync,
    Async,
}

pub type ConstructFn = Arc<dyn Fn(Vec<HostValue>) -> Result<u64, JsError> + Send + Sync>;
pub type MethodFn = Arc<dyn Fn(u64, Vec<HostValue>) -> HostFuture + Send + Sync>;
pub type StaticFn = Arc<dyn Fn(Vec<HostValue>) -> HostFuture + Send + Sync>;

pub struct MethodSpec {
    pub name: String,
    pub kind: MethodKind,
    pub func: MethodFn,
}

impl MethodSpec {
    pub fn sync(
        name: impl Into<String>,
        func: impl Fn(u64, Vec<HostValue>) -> Result<HostValue, JsError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Sync,
            func: Arc::new(move |id, args| {
                let result = func(id, args);
                Box::pin(async move { result })
            }),
        }
    }

    pub fn async_method(name: impl Into<String>, func: MethodFn) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Async,
            func,
        }
    }
}

pub struct PropertySpec {
    pub name: String,
    pub get: MethodFn,
    pub set: Option<MethodFn>,
}

impl PropertySpec {
    pub fn getter(
        name: impl Into<String>,
        get: impl Fn(u64, Vec<HostValue>) -> Result<HostValue, JsError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            get: Arc::new(move |id, args| {
                let result = get(id, args);
                Box::pin(async move { result })
            }),
            set: None,
        }
    }

    pub fn with_setter(
        mut self,
        set: impl Fn(u64, Vec<HostValue>) -> Result<HostValue, JsError> + Send + Sync + 'static,
    ) -> Self {
        self.set = Some(Arc::new(move |id, args| {
            let result = set(id, args);
            Box::pin(async move { result })
        }));
        self
    }
}

pub struct StaticMethodSpec {
    pub name: String,
    pub kind: MethodKind,
    pub func: StaticFn,
}

impl StaticMethodSpec {
    pub fn sync(
        name: impl Into<String>,
        func: impl Fn(Vec<HostValue>) -> Result<HostValue, JsError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Sync,
            func: Arc::new(move |args| {
                let result = func(args);
                Box::pin(async move { result })
            }),
        }
    }

    pub fn async_method(name: impl Into<String>, func: StaticFn) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Async,
            func,
        }
    }
}

pub struct StaticPropertySpec {
    pub name: String,
    pub get: StaticFn,
}

impl StaticPropertySpec {
    pub fn getter(
        name: impl Into<String>,
        get: impl Fn(Vec<HostValue>) -> Result<HostValue, JsError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            get: Arc::new(move |args| {
                let result = get(args);
                Box::pin(async move { result })
            }),
        }
    }
}

/// Declarative description of a guest class whose members trampoline to
/// host callbacks keyed by instance id.
#[derive(Default)]
pub struct ClassSpec {
    pub name: String,
    pub extends: Option<String>,
    pub construct: Option<ConstructFn>,
    pub methods: Vec<MethodSpec>,
    pub properties: Vec<PropertySpec>,
    pub static_methods: Vec<StaticMethodSpec>,
    pub static_properties: Vec<StaticPropertySpec>,
}

impl ClassSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    pub fn construct(
        mut self,
        construct: impl Fn(Vec<HostValue>) -> Result<u64, JsError> + Send + Sync + 'static,
    ) -> Self {
        self.construct = Some(Arc::new(construct));
        self
    }

    pub fn method(mut self, method: MethodSpec) -> Self {
        self.methods.push(method);
        self
    }

    pub fn property(mut self, property: PropertySpec) -> Self {
        self.properties.push(property);
        self
    }

    pub fn static_method(mut self, method: StaticMethodSpec) -> Self {
        self.static_methods.push(method);
        self
    }

    pub fn static_property(mut self, property: StaticPropertySpec) -> Self {
        self.static_properties.push(property);
        self
    }
}

/// Tracks which classes exist in a context, so `extends` resolves at
/// registration time.
#[derive(Clone, Default)]
pub struct ClassRegistry {
    inner: Arc<ClassRegistryInner>,
}

#[derive(Default)]
struct ClassRegistryInner {
    defined: Mutex<FxHashSet<String>>,
    prelude_installed: AtomicBool,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.defined.lock().unwrap().contains(name)
    }
}

/// The return-value marker the guest prelude turns into a wrapped class
/// instance. Host methods use this to hand out new guest objects (for
/// example `blob.stream()` returning a ReadableStream instance).
pub fn wrap_instance(class_name: &str, id: u64) -> HostValue {
    HostValue::object(vec![
        (
            "__wrapClass".to_string(),
            HostValue::string(class_name),
        ),
        ("__wrapId".to_string(), HostValue::Int(id as i64)),
    ])
}

/// Builds guest class shims over host callbacks.
pub struct ClassBuilder {
    registry: ClassRegistry,
    instances: InstanceRegistry,
}

impl ClassBuilder {
    pub fn new(registry: ClassRegistry, instances: InstanceRegistry) -> Self {
        Self {
            registry,
            instances,
        }
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// Installs the host callbacks for every member, then evaluates the
    /// generated guest class.
    pub async fn define(&self, engine: &mut dyn Engine, spec: ClassSpec) -> Result<(), JsError> {
        if let Some(parent) = &spec.extends {
            if !self.registry.contains(parent) {
                return Err(JsError::type_error(format!(
                    "Unknown parent class '{parent}' for '{}'",
                    spec.name
                )));
            }
        }
        self.ensure_prelude(engine).await?;

        let name = spec.name.clone();
        if let Some(construct) = &spec.construct {
            engine
                .set_global_callback(
                    &format!("__{name}_construct"),
                    construct_callback(construct.clone()),
                )
                .map_err(EngineError::into_js_error)?;
        }
        for method in &spec.methods {
            engine
                .set_global_callback(
                    &format!("__{name}_{}", method.name),
                    method_callback(self.instances.clone(), method.func.clone()),
                )
                .map_err(EngineError::into_js_error)?;
        }
        for property in &spec.properties {
            engine
                .set_global_callback(
                    &format!("__{name}_get_{}", property.name),
                    method_callback(self.instances.clone(), property.get.clone()),
                )
                .map_err(EngineError::into_js_error)?;
            if let Some(set) = &property.set {
                engine
                    .set_global_callback(
                        &format!("__{name}_set_{}", property.name),
                        method_callback(self.instances.clone(), set.clone()),
                    )
                    .map_err(EngineError::into_js_error)?;
            }
        }
        for method in &spec.static_methods {
            engine
                .set_global_callback(
                    &format!("__{name}_static_{}", method.name),
                    static_callback(method.func.clone()),
                )
                .map_err(EngineError::into_js_error)?;
        }
        for property in &spec.static_properties {
            engine
                .set_global_callback(
                    &format!("__{name}_static_get_{}", property.name),
                    static_callback(property.get.clone()),
                )
                .map_err(EngineError::into_js_error)?;
        }

        let source = generate_class_source(&spec);
        engine
            .eval(&source)
            .await
            .map_err(EngineError::into_js_error)?;

        self.registry.inner.defined.lock().unwrap().insert(name);
        Ok(())
    }

    async fn ensure_prelude(&self, engine: &mut dyn Engine) -> Result<(), JsError> {
        if self
            .registry
            .inner
            .prelude_installed
            .swap(true, Ordering::SeqCst)
        {
            return Ok(());
        }
        engine
            .eval(PRELUDE)
            .await
            .map(|_| ())
            .map_err(EngineError::into_js_error)
    }
}

fn prefixed(error: JsError) -> JsError {
    JsError::error(error.encode_prefixed())
}

fn construct_callback(construct: ConstructFn) -> NativeCallback {
    Arc::new(move |args: Vec<EngineValue>| {
        let construct = construct.clone();
        Box::pin(async move {
            let host_args: Vec<HostValue> =
                args.into_iter().map(HostValue::from_engine).collect();
            match construct(host_args) {
                Ok(id) => Ok(EngineValue::Number(id as f64)),
                Err(error) => Err(prefixed(error)),
            }
        })
    })
}

fn method_callback(instances: InstanceRegistry, func: MethodFn) -> NativeCallback {
    Arc::new(move |args: Vec<EngineValue>| {
        let instances = instances.clone();
        let func = func.clone();
        Box::pin(async move {
            let mut args = args.into_iter();
            let id = args
                .next()
                .and_then(|value| value.as_number())
                .map(|number| number as u64)
                .ok_or_else(|| prefixed(JsError::type_error("Missing instance id")))?;
            if !instances.contains(id) {
                return Err(prefixed(JsError::error(format!("Instance {id} not found"))));
            }
            let host_args: Vec<HostValue> = args.map(HostValue::from_engine).collect();
            let result = func(id, host_args).await.map_err(prefixed)?;
            result.to_engine().map_err(prefixed)
        })
    })
}

fn static_callback(func: StaticFn) -> NativeCallback {
    Arc::new(move |args: Vec<EngineValue>| {
        let func = func.clone();
        Box::pin(async move {
            let host_args: Vec<HostValue> =
                args.into_iter().map(HostValue::from_engine).collect();
            let result = func(host_args).await.map_err(prefixed)?;
            result.to_engine().map_err(prefixed)
        })
    })
}

fn generate_class_source(spec: &ClassSpec) -> String {
    let name = &spec.name;
    let mut source = String::with_capacity(1024);
    source.push_str("(() => {\n  const { ids, skip } = globalThis.__islet;\n");
    match &spec.extends {
        Some(parent) => {
            let _ = writeln!(source, "  class {name} extends {parent} {{");
            source.push_str("    constructor(...args) {\n      super(skip);\n");
        },
        None => {
            let _ = writeln!(source, "  class {name} {{");
            source.push_str("    constructor(...args) {\n");
        },
    }
    source.push_str("      if (args[0] === skip) { return; }\n");
    if spec.construct.is_some() {
        let _ = writeln!(
            source,
            "      ids.set(this, __islet.call(__{name}_construct, args));"
        );
    } else {
        let _ = writeln!(
            source,
            "      throw new TypeError(\"Illegal constructor\");"
        );
    }
    source.push_str("    }\n");

    for method in &spec.methods {
        let method_name = &method.name;
        match method.kind {
            MethodKind::Sync => {
                let _ = writeln!(
                    source,
                    "    {method_name}(...args) {{ return __islet.call(__{name}_{method_name}, [ids.get(this), ...args]); }}"
                );
            },
            MethodKind::Async => {
                let _ = writeln!(
                    source,
                    "    async {method_name}(...args) {{ return __islet.acall(__{name}_{method_name}, [ids.get(this), ...args]); }}"
                );
            },
        }
    }
    for property in &spec.properties {
        let property_name = &property.name;
        let _ = writeln!(
            source,
            "    get {property_name}() {{ return __islet.call(__{name}_get_{property_name}, [ids.get(this)]); }}"
        );
        if property.set.is_some() {
            let _ = writeln!(
                source,
                "    set {property_name}(value) {{ __islet.call(__{name}_set_{property_name}, [ids.get(this), value]); }}"
            );
        }
    }
    for method in &spec.static_methods {
        let method_name = &method.name;
        match method.kind {
            MethodKind::Sync => {
                let _ = writeln!(
                    source,
                    "    static {method_name}(...args) {{ return __islet.call(__{name}_static_{method_name}, args); }}"
                );
            },
            MethodKind::Async => {
                let _ = writeln!(
                    source,
                    "    static async {method_name}(...args) {{ return __islet.acall(__{name}_static_{method_name}, args); }}"
                );
            },
        }
    }
    for property in &spec.static_properties {
        let property_name = &property.name;
        let _ = writeln!(
            source,
            "    static get {property_name}() {{ return __islet.call(__{name}_static_get_{property_name}, []); }}"
        );
    }

    source.push_str("  }\n");
    let _ = writeln!(
        source,
        "  __islet.wrappers[\"{name}\"] = (id) => {{ const instance = Object.create({name}.prototype); ids.set(instance, id); return instance; }};"
    );
    let _ = writeln!(source, "  globalThis.{name} = {name};");
    source.push_str("})();\n");
    source
}
