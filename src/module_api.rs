use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, FnPtr, Map, Variant, FLOAT, INT};

use crate::capability::object::{avatar_map, parse_object_id};
use crate::capability::{
    GraphicsCapability, HeightmapCapability, HostCapability, ObjectCapability, ObjectsCapability,
    PersistenceCapability, SchedulerCapability, WorldCapability,
};
use crate::compile::libraries::Library;
use crate::error::CapabilityError;
use crate::policy::TrustPolicy;
use crate::region::Vector3;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

pub struct EngineOptions<'a> {
    pub script: &'a str,
    pub libraries: &'a [Library],
    pub policy: Option<&'a TrustPolicy>,
    pub abort: Option<Arc<AtomicBool>>,
}

/// Builds the Rhai engine a module compiles or runs against.
pub fn build_engine(options: EngineOptions<'_>) -> Engine {
    let mut engine = Engine::new_raw();
    engine.set_fast_operators(true);
    for library in options.libraries {
        library.install(&mut engine);
    }
    if let Some(policy) = options.policy {
        policy.apply_limits(&mut engine);
    }
    if let Some(abort) = options.abort {
        engine.on_progress(move |_| {
            if abort.load(Ordering::Acquire) {
                Some(Dynamic::from("boundary unloaded".to_string()))
            } else {
                None
            }
        });
    }
    let script = options.script.to_string();
    let print_name = script.clone();
    engine.on_print(move |text| tracing::info!("[mrm:{print_name}] {text}"));
    engine.on_debug(move |text, _source, pos| tracing::debug!("[mrm:{script}] {pos:?} {text}"));
    engine
}

fn rhai_err(err: CapabilityError) -> Box<EvalAltResult> {
    err.into()
}

fn handler_name(handler: &FnPtr) -> RhaiResult<String> {
    if handler.is_curried() {
        return Err(format!("handler '{}' captures variables; pass a named function", handler.fn_name()).into());
    }
    Ok(handler.fn_name().to_string())
}

fn optional<T: Variant + Clone>(value: Option<T>) -> Dynamic {
    value.map(Dynamic::from).unwrap_or(Dynamic::UNIT)
}

fn proxies(objects: Vec<ObjectCapability>) -> Array {
    objects.into_iter().map(Dynamic::from).collect()
}

/// Registers the capability surface modules script against.
pub fn register_api(engine: &mut Engine) {
    register_vector(engine);
    register_world(engine);
    register_objects(engine);
    register_object(engine);
    register_host(engine);
}

fn register_vector(engine: &mut Engine) {
    engine
        .register_type_with_name::<Vector3>("Vector3")
        .register_fn("vec3", |x: FLOAT, y: FLOAT, z: FLOAT| Vector3::new(x, y, z))
        .register_fn("vec3", |x: INT, y: INT, z: INT| Vector3::new(x as f64, y as f64, z as f64))
        .register_get_set("x", |v: &mut Vector3| v.x, |v: &mut Vector3, x: FLOAT| v.x = x)
        .register_get_set("y", |v: &mut Vector3| v.y, |v: &mut Vector3, y: FLOAT| v.y = y)
        .register_get_set("z", |v: &mut Vector3| v.z, |v: &mut Vector3, z: FLOAT| v.z = z)
        .register_fn("to_string", |v: &mut Vector3| v.to_string())
        .register_fn("==", |a: Vector3, b: Vector3| a == b);
}

fn register_world(engine: &mut Engine) {
    engine
        .register_type_with_name::<WorldCapability>("World")
        .register_get("region_name", |world: &mut WorldCapability| world.region_name().map_err(rhai_err))
        .register_get("objects", |world: &mut WorldCapability| world.objects().map_err(rhai_err))
        .register_get("terrain", |world: &mut WorldCapability| world.terrain().map_err(rhai_err))
        .register_get("avatars", |world: &mut WorldCapability| -> RhaiResult<Array> {
            let avatars = world.avatars().map_err(rhai_err)?;
            Ok(avatars.iter().map(|avatar| Dynamic::from_map(avatar_map(avatar))).collect())
        })
        .register_get("parcels", |world: &mut WorldCapability| -> RhaiResult<Array> {
            let parcels = world.parcels().map_err(rhai_err)?;
            Ok(parcels
                .into_iter()
                .map(|parcel| {
                    let mut map = Map::new();
                    map.insert("id".into(), Dynamic::from(parcel.id.to_string()));
                    map.insert("name".into(), Dynamic::from(parcel.name));
                    map.insert("owner".into(), Dynamic::from(parcel.owner.to_string()));
                    map.insert("area".into(), Dynamic::from(parcel.area));
                    Dynamic::from_map(map)
                })
                .collect())
        })
        .register_fn("on_chat", |world: &mut WorldCapability, handler: FnPtr| -> RhaiResult<()> {
            world.on_chat(&handler_name(&handler)?).map_err(rhai_err)
        })
        .register_fn("remove_chat", |world: &mut WorldCapability, handler: FnPtr| -> RhaiResult<()> {
            world.remove_chat(&handler_name(&handler)?).map_err(rhai_err)
        })
        .register_fn("on_new_user", |world: &mut WorldCapability, handler: FnPtr| -> RhaiResult<()> {
            world.on_new_user(&handler_name(&handler)?).map_err(rhai_err)
        })
        .register_fn("remove_new_user", |world: &mut WorldCapability, handler: FnPtr| -> RhaiResult<()> {
            world.remove_new_user(&handler_name(&handler)?).map_err(rhai_err)
        });

    engine
        .register_type_with_name::<HeightmapCapability>("Heightmap")
        .register_get("width", |map: &mut HeightmapCapability| map.width().map_err(rhai_err))
        .register_get("length", |map: &mut HeightmapCapability| map.length().map_err(rhai_err))
        .register_fn("get", |map: &mut HeightmapCapability, x: INT, y: INT| map.get(x, y).map_err(rhai_err))
        .register_fn("set", |map: &mut HeightmapCapability, x: INT, y: INT, h: FLOAT| {
            map.set(x, y, h).map_err(rhai_err)
        });
}

fn register_objects(engine: &mut Engine) {
    engine
        .register_type_with_name::<ObjectsCapability>("Objects")
        .register_fn("get", |objects: &mut ObjectsCapability, id: &str| -> RhaiResult<Dynamic> {
            let id = parse_object_id(id).map_err(rhai_err)?;
            Ok(optional(objects.get(id).map_err(rhai_err)?))
        })
        .register_fn("by_local_id", |objects: &mut ObjectsCapability, local_id: INT| -> RhaiResult<Dynamic> {
            let Ok(local_id) = u32::try_from(local_id) else { return Ok(Dynamic::UNIT) };
            Ok(optional(objects.by_local_id(local_id).map_err(rhai_err)?))
        })
        .register_fn("find", |objects: &mut ObjectsCapability, name: &str| -> RhaiResult<Array> {
            Ok(proxies(objects.find(name).map_err(rhai_err)?))
        })
        .register_get("all", |objects: &mut ObjectsCapability| -> RhaiResult<Array> {
            Ok(proxies(objects.all().map_err(rhai_err)?))
        })
        .register_get("count", |objects: &mut ObjectsCapability| -> RhaiResult<INT> {
            Ok(objects.count().map_err(rhai_err)? as INT)
        })
        .register_fn("create", |objects: &mut ObjectsCapability, name: &str, position: Vector3| {
            objects.create(name, position).map_err(rhai_err)
        })
        .register_fn("remove", |objects: &mut ObjectsCapability, object: ObjectCapability| {
            objects.remove(&object).map_err(rhai_err)
        });
}

fn register_object(engine: &mut Engine) {
    engine
        .register_type_with_name::<ObjectCapability>("Object")
        .register_get("id", |object: &mut ObjectCapability| object.id().to_string())
        .register_get("exists", |object: &mut ObjectCapability| object.exists())
        .register_get("local_id", |object: &mut ObjectCapability| -> RhaiResult<INT> {
            Ok(object.local_id().map_err(rhai_err)? as INT)
        })
        .register_get("owner", |object: &mut ObjectCapability| -> RhaiResult<String> {
            Ok(object.owner().map_err(rhai_err)?.to_string())
        })
        .register_get_set(
            "name",
            |object: &mut ObjectCapability| object.name().map_err(rhai_err),
            |object: &mut ObjectCapability, value: String| object.set_name(&value).map_err(rhai_err),
        )
        .register_get_set(
            "description",
            |object: &mut ObjectCapability| object.description().map_err(rhai_err),
            |object: &mut ObjectCapability, value: String| object.set_description(&value).map_err(rhai_err),
        )
        .register_get_set(
            "text",
            |object: &mut ObjectCapability| object.text().map_err(rhai_err),
            |object: &mut ObjectCapability, value: String| object.set_text(&value).map_err(rhai_err),
        )
        .register_get_set(
            "position",
            |object: &mut ObjectCapability| object.position().map_err(rhai_err),
            |object: &mut ObjectCapability, value: Vector3| object.set_position(value).map_err(rhai_err),
        )
        .register_fn("say", |object: &mut ObjectCapability, message: &str| object.say(message, 0).map_err(rhai_err))
        .register_fn("say", |object: &mut ObjectCapability, message: &str, channel: INT| {
            object.say(message, channel).map_err(rhai_err)
        })
        .register_fn("on_touch", |object: &mut ObjectCapability, handler: FnPtr| -> RhaiResult<()> {
            object.on_touch(&handler_name(&handler)?).map_err(rhai_err)
        })
        .register_fn("remove_touch", |object: &mut ObjectCapability, handler: FnPtr| -> RhaiResult<()> {
            object.remove_touch(&handler_name(&handler)?).map_err(rhai_err)
        })
        .register_fn("==", |a: &mut ObjectCapability, b: ObjectCapability| a.same_proxy(&b))
        .register_fn("!=", |a: &mut ObjectCapability, b: ObjectCapability| !a.same_proxy(&b));
}

fn register_host(engine: &mut Engine) {
    engine
        .register_type_with_name::<HostCapability>("Host")
        .register_get("object", |host: &mut HostCapability| host.object().map_err(rhai_err))
        .register_get("microthreads", |host: &mut HostCapability| host.microthreads().map_err(rhai_err))
        .register_get("persistence", |host: &mut HostCapability| host.persistence().map_err(rhai_err))
        .register_get("graphics", |host: &mut HostCapability| host.graphics().map_err(rhai_err))
        .register_fn("log", |host: &mut HostCapability, message: &str| host.log(message).map_err(rhai_err));

    engine
        .register_type_with_name::<SchedulerCapability>("Microthreads")
        .register_fn("spawn", |threads: &mut SchedulerCapability, handler: FnPtr| -> RhaiResult<INT> {
            Ok(threads.spawn(&handler_name(&handler)?).map_err(rhai_err)? as INT)
        })
        .register_fn("cancel", |threads: &mut SchedulerCapability, id: INT| -> RhaiResult<bool> {
            let Ok(id) = u64::try_from(id) else { return Ok(false) };
            threads.cancel(id).map_err(rhai_err)
        })
        .register_get("count", |threads: &mut SchedulerCapability| -> RhaiResult<INT> {
            Ok(threads.count().map_err(rhai_err)? as INT)
        });

    engine
        .register_type_with_name::<PersistenceCapability>("Persistence")
        .register_fn("get", |store: &mut PersistenceCapability, key: &str| -> RhaiResult<Dynamic> {
            Ok(optional(store.get(key).map_err(rhai_err)?))
        })
        .register_fn("put", |store: &mut PersistenceCapability, key: &str, value: &str| {
            store.put(key, value).map_err(rhai_err)
        });

    engine
        .register_type_with_name::<GraphicsCapability>("Graphics")
        .register_fn(
            "save_bitmap",
            |graphics: &mut GraphicsCapability, bytes: Blob, lossless: bool, temporary: bool| -> RhaiResult<String> {
                Ok(graphics.save_bitmap(&bytes, lossless, temporary).map_err(rhai_err)?.to_string())
            },
        )
        .register_fn("load_bitmap", |graphics: &mut GraphicsCapability, id: &str| -> RhaiResult<Blob> {
            let id = parse_object_id(id).map_err(rhai_err)?;
            graphics.load_bitmap(id).map_err(rhai_err)
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_are_scriptable() {
        let engine = build_engine(EngineOptions {
            script: "test",
            libraries: &Library::BASELINE,
            policy: None,
            abort: None,
        });
        let x: FLOAT = engine.eval("let v = vec3(1, 2, 3); v.x = 4.5; v.x + v.z").expect("eval vector");
        assert_eq!(x, 7.5);
    }

    #[test]
    fn abort_flag_terminates_running_code() {
        let abort = Arc::new(AtomicBool::new(true));
        let engine = build_engine(EngineOptions {
            script: "test",
            libraries: &Library::BASELINE,
            policy: None,
            abort: Some(abort),
        });
        let err = engine.eval::<()>("loop { }").expect_err("aborted engine must stop");
        assert!(matches!(*err, EvalAltResult::ErrorTerminated(..)));
    }

    #[test]
    fn policy_limits_bound_operations() {
        let policy = TrustPolicy::named("nothing");
        let engine = build_engine(EngineOptions {
            script: "test",
            libraries: &Library::BASELINE,
            policy: Some(&policy),
            abort: None,
        });
        let err = engine.eval::<()>("let x = 0; loop { x += 1; }").expect_err("runaway loop is cut off");
        assert!(matches!(*err, EvalAltResult::ErrorTooManyOperations(..)));
    }
}
