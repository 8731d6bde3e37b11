//! End-to-end hot-reload scenarios over in-memory module graphs.
//!
//! Each test boots a small graph through a `MemoryLoader`, edits sources
//! by re-registering them, and drives `notify_changed` →
//! `request_update_result` the way the watcher would.

use rustc_hash::FxHashMap;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::application::{Application, MemoryLoader, ModuleSource};
use crate::controller::UpdateStatus;
use crate::module::{
    LoadedModuleRequest, ModuleBinding, ModuleBody, ModuleFormat, ModuleScope, Value,
};
use crate::util::BoxFuture;

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    loader: Arc<MemoryLoader>,
    application: Arc<Application>,
}

impl Fixture {
    fn new() -> Self {
        let loader = Arc::new(MemoryLoader::new());
        let application = Application::new(loader.clone());
        Self {
            loader,
            application,
        }
    }

    async fn boot(&self, url: &str) -> anyhow::Result<()> {
        self.application.main(url).await
    }

    /// Simulate a watcher event: re-import the URL under a bumped version
    /// and await the debounced update.
    async fn reload(&self, url: &str) -> Option<UpdateStatus> {
        self.application
            .notify_changed(url)
            .await
            .expect("re-import failed");
        self.application.request_update_result().await
    }

    fn namespace(&self, url: &str) -> Value {
        self.application
            .acquire(url)
            .module_namespace()
            .expect("module namespace")
    }

    fn export_of(&self, url: &str, name: &str) -> Value {
        self.namespace(url)[name].clone()
    }
}

fn runs() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

fn flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

/// Build a synchronous module source: static imports (URL + bindings),
/// declared exports, and a body closure.
fn module(
    imports: Vec<(&str, Vec<ModuleBinding>)>,
    exports: &[&str],
    body: impl Fn(&ModuleScope) -> anyhow::Result<()> + Send + Sync + 'static,
) -> ModuleSource {
    let imports: Vec<(String, Vec<ModuleBinding>)> = imports
        .into_iter()
        .map(|(url, bindings)| (url.to_string(), bindings))
        .collect();
    let exports: Vec<String> = exports.iter().map(|e| e.to_string()).collect();
    let body: Arc<dyn Fn(&ModuleScope) -> anyhow::Result<()> + Send + Sync> = Arc::new(body);
    let urls: Vec<String> = imports.iter().map(|(url, _)| url.clone()).collect();
    ModuleSource::new(urls, move |application, controller| {
        let loaded = imports
            .iter()
            .map(|(url, bindings)| {
                LoadedModuleRequest::new(url.clone(), bindings.clone(), application.thunk(url))
            })
            .collect();
        let body = body.clone();
        controller.load(
            ModuleBody::new_sync(exports.clone(), move |scope| (&*body)(scope)),
            None,
            false,
            ModuleFormat::Module,
            FxHashMap::default(),
            loaded,
        );
    })
}

/// Build an async module source with dynamic-import support.
fn module_async(
    imports: Vec<(&str, Vec<ModuleBinding>)>,
    exports: &[&str],
    body: impl Fn(ModuleScope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
) -> ModuleSource {
    let imports: Vec<(String, Vec<ModuleBinding>)> = imports
        .into_iter()
        .map(|(url, bindings)| (url.to_string(), bindings))
        .collect();
    let exports: Vec<String> = exports.iter().map(|e| e.to_string()).collect();
    let body: Arc<dyn Fn(ModuleScope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync> =
        Arc::new(body);
    let urls: Vec<String> = imports.iter().map(|(url, _)| url.clone()).collect();
    ModuleSource::new(urls, move |application, controller| {
        let loaded = imports
            .iter()
            .map(|(url, bindings)| {
                LoadedModuleRequest::new(url.clone(), bindings.clone(), application.thunk(url))
            })
            .collect();
        let body = body.clone();
        controller.load(
            ModuleBody::new_async(exports.clone(), move |scope| (&*body)(scope)),
            None,
            true,
            ModuleFormat::Module,
            FxHashMap::default(),
            loaded,
        );
    })
}

fn counter_module(value: i64) -> ModuleSource {
    module(vec![], &["counter"], move |scope| {
        scope.export("counter", json!(value))
    })
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn simple_child_update_reruns_self_accepting_main() {
    let fx = Fixture::new();
    let main_runs = runs();

    fx.loader.register("child", counter_module(1));
    let tracked = main_runs.clone();
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &["value"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.hot().accept();
                let counter = scope.import("counter")?;
                scope.export("value", counter)
            },
        ),
    );

    fx.boot("main").await.unwrap();
    assert_eq!(main_runs.load(Ordering::SeqCst), 1);
    assert_eq!(fx.export_of("main", "value"), json!(1));

    fx.loader.register("child", counter_module(2));
    let status = fx.reload("child").await.unwrap();
    assert_eq!(status.kind(), "success");
    assert_eq!(main_runs.load(Ordering::SeqCst), 2);
    assert_eq!(fx.export_of("main", "value"), json!(2));
}

#[tokio::test(start_paused = true)]
async fn unaccepted_update_leaves_graph_untouched() {
    let fx = Fixture::new();
    let main_runs = runs();

    fx.loader.register("child", counter_module(1));
    let tracked = main_runs.clone();
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &["value"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.export("value", scope.import("counter")?)
            },
        ),
    );

    fx.boot("main").await.unwrap();
    fx.loader.register("child", counter_module(2));
    let status = fx.reload("child").await.unwrap();

    assert_eq!(status.kind(), "unaccepted");
    let UpdateStatus::Unaccepted { chain } = status else {
        panic!("expected unaccepted")
    };
    let modules = chain.modules();
    assert!(modules.contains(&"main".to_string()));
    assert!(modules.contains(&"child".to_string()));

    // Nothing ran, nothing changed.
    assert_eq!(main_runs.load(Ordering::SeqCst), 1);
    assert_eq!(fx.export_of("main", "value"), json!(1));
}

#[tokio::test(start_paused = true)]
async fn accepted_dependency_list_with_unupdated_member() {
    let fx = Fixture::new();
    let main_runs = runs();
    let callback_fired = flag();

    fx.loader.register("updated", counter_module(1));
    fx.loader.register("unupdated", counter_module(10));
    let tracked = main_runs.clone();
    let fired = callback_fired.clone();
    fx.loader.register(
        "main",
        module(
            vec![
                (
                    "updated",
                    vec![ModuleBinding::import_as("counter", "updated_counter")],
                ),
                (
                    "unupdated",
                    vec![ModuleBinding::import_as("counter", "unupdated_counter")],
                ),
            ],
            &["value"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                let fired = fired.clone();
                scope
                    .hot()
                    .accept_of_with(["updated", "unupdated"], move |_namespace| {
                        fired.store(true, Ordering::SeqCst);
                        Ok(())
                    });
                scope.export("value", scope.import("updated_counter")?)
            },
        ),
    );

    fx.boot("main").await.unwrap();
    fx.loader.register("updated", counter_module(2));
    let status = fx.reload("updated").await.unwrap();

    assert_eq!(status.kind(), "success");
    // The accept callback fired; the body itself did not re-run.
    assert!(callback_fired.load(Ordering::SeqCst));
    assert_eq!(main_runs.load(Ordering::SeqCst), 1);
    // Live binding rebound to the new instance without re-evaluation.
    assert_eq!(fx.export_of("updated", "counter"), json!(2));
}

#[tokio::test(start_paused = true)]
async fn link_error_is_recoverable_from_parent() {
    let fx = Fixture::new();
    let main_runs = runs();
    let disposed = flag();

    fx.loader.register(
        "child",
        module(vec![], &["symbol"], |scope| {
            scope.export("symbol", json!("s"))
        }),
    );
    let tracked = main_runs.clone();
    let dispose_flag = disposed.clone();
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("symbol")])],
            &[],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.hot().accept();
                let dispose_flag = dispose_flag.clone();
                scope.hot().dispose(move |_data| {
                    dispose_flag.store(true, Ordering::SeqCst);
                    Ok(())
                });
                scope.import("symbol").map(|_| ())
            },
        ),
    );

    fx.boot("main").await.unwrap();

    // The symbol disappears: the update must fail the link test without
    // running any user code.
    fx.loader.register("child", module(vec![], &[], |_| Ok(())));
    let status = fx.reload("child").await.unwrap();
    assert_eq!(status.kind(), "linkError");
    assert!(!disposed.load(Ordering::SeqCst));
    assert_eq!(main_runs.load(Ordering::SeqCst), 1);
    assert_eq!(fx.export_of("child", "symbol"), json!("s"));

    // Fix the parent to stop importing the symbol; now both replace.
    fx.loader.register(
        "main",
        module(vec![("child", vec![])], &[], |scope| {
            scope.hot().accept();
            Ok(())
        }),
    );
    let status = fx.reload("main").await.unwrap();
    assert_eq!(status.kind(), "success");
}

#[tokio::test(start_paused = true)]
async fn infinite_star_reexport_fails_dispatch() {
    let fx = Fixture::new();

    let source = ModuleSource::new(["child"], |application, controller| {
        controller.load(
            ModuleBody::new_sync(Vec::<String>::new(), |_| Ok(())),
            None,
            false,
            ModuleFormat::Module,
            FxHashMap::default(),
            vec![LoadedModuleRequest::new(
                "child",
                vec![ModuleBinding::export_star()],
                application.thunk("child"),
            )],
        );
    });
    fx.loader.register("child", source);
    fx.loader.register(
        "main",
        module(vec![("child", vec![])], &[], |_| Ok(())),
    );

    let error = fx.boot("main").await.unwrap_err();
    assert!(format!("{error:#}").contains("export *"));
}

#[tokio::test(start_paused = true)]
async fn declined_module_still_accepts_its_own_child() {
    let fx = Fixture::new();
    let dec_runs = runs();
    let leaf_runs = runs();

    let tracked = leaf_runs.clone();
    fx.loader.register(
        "leaf",
        module(vec![], &["counter"], move |scope| {
            tracked.fetch_add(1, Ordering::SeqCst);
            scope.export("counter", json!(1))
        }),
    );
    let tracked = dec_runs.clone();
    fx.loader.register(
        "dec",
        module(
            vec![("leaf", vec![ModuleBinding::import("counter")])],
            &["relay"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.hot().accept_of(["leaf"]);
                scope.hot().decline();
                scope.export("relay", scope.import("counter")?)
            },
        ),
    );
    fx.loader.register(
        "main",
        module(
            vec![("dec", vec![ModuleBinding::import("relay")])],
            &[],
            |scope| scope.import("relay").map(|_| ()),
        ),
    );

    fx.boot("main").await.unwrap();

    // An update below the declining module succeeds: decline only fires
    // when the declining module itself is invalidated.
    let tracked = leaf_runs.clone();
    fx.loader.register(
        "leaf",
        module(vec![], &["counter"], move |scope| {
            tracked.fetch_add(1, Ordering::SeqCst);
            scope.export("counter", json!(2))
        }),
    );
    let status = fx.reload("leaf").await.unwrap();
    assert_eq!(status.kind(), "success");
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
    assert_eq!(dec_runs.load(Ordering::SeqCst), 1);

    // Updating the declining module itself is refused.
    fx.loader.register(
        "dec",
        module(vec![("leaf", vec![])], &["relay"], |scope| {
            scope.export("relay", json!(0))
        }),
    );
    let status = fx.reload("dec").await.unwrap();
    let UpdateStatus::Declined { declined } = status else {
        panic!("expected declined")
    };
    assert_eq!(declined, ["dec"]);
    assert_eq!(dec_runs.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test(start_paused = true)]
async fn no_update_without_new_code_or_invalidation() {
    let fx = Fixture::new();
    let main_runs = runs();

    fx.loader.register("child", counter_module(1));
    let tracked = main_runs.clone();
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &[],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.hot().accept();
                scope.import("counter").map(|_| ())
            },
        ),
    );
    fx.boot("main").await.unwrap();

    fx.application.request_update();
    let status = fx.application.request_update_result().await;
    assert!(status.is_none());
    assert_eq!(main_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn self_accepting_module_updates_in_isolation() {
    let fx = Fixture::new();
    let child_runs = runs();
    let main_runs = runs();

    let tracked = child_runs.clone();
    fx.loader.register(
        "child",
        module(vec![], &["counter"], move |scope| {
            tracked.fetch_add(1, Ordering::SeqCst);
            scope.hot().accept();
            scope.export("counter", json!(1))
        }),
    );
    let tracked = main_runs.clone();
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &[],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.import("counter").map(|_| ())
            },
        ),
    );
    fx.boot("main").await.unwrap();

    let tracked = child_runs.clone();
    fx.loader.register(
        "child",
        module(vec![], &["counter"], move |scope| {
            tracked.fetch_add(1, Ordering::SeqCst);
            scope.hot().accept();
            scope.export("counter", json!(2))
        }),
    );
    let status = fx.reload("child").await.unwrap();

    assert_eq!(status.kind(), "success");
    assert_eq!(child_runs.load(Ordering::SeqCst), 2);
    // The importer was never re-evaluated.
    assert_eq!(main_runs.load(Ordering::SeqCst), 1);
    assert_eq!(fx.export_of("child", "counter"), json!(2));
}

#[tokio::test(start_paused = true)]
async fn decline_blocks_update_without_side_effects() {
    let fx = Fixture::new();
    let leaf_runs = runs();
    let disposed = flag();

    let tracked = leaf_runs.clone();
    fx.loader.register(
        "leaf",
        module(vec![], &["counter"], move |scope| {
            tracked.fetch_add(1, Ordering::SeqCst);
            scope.export("counter", json!(1))
        }),
    );
    let dispose_flag = disposed.clone();
    fx.loader.register(
        "dec",
        module(
            vec![("leaf", vec![ModuleBinding::import("counter")])],
            &[],
            move |scope| {
                scope.hot().decline();
                let dispose_flag = dispose_flag.clone();
                scope.hot().dispose(move |_| {
                    dispose_flag.store(true, Ordering::SeqCst);
                    Ok(())
                });
                scope.import("counter").map(|_| ())
            },
        ),
    );
    fx.loader.register(
        "main",
        module(vec![("dec", vec![])], &[], |_| Ok(())),
    );
    fx.boot("main").await.unwrap();

    fx.loader.register("leaf", counter_module(2));
    let status = fx.reload("leaf").await.unwrap();

    assert_eq!(status.kind(), "declined");
    assert!(!disposed.load(Ordering::SeqCst));
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 1);
    assert_eq!(fx.export_of("leaf", "counter"), json!(1));
}

#[tokio::test(start_paused = true)]
async fn evaluation_error_rolls_back_to_previous() {
    let fx = Fixture::new();
    let main_runs = runs();

    fx.loader.register("child", counter_module(1));
    let tracked = main_runs.clone();
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &["value"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.hot().accept();
                scope.export("value", scope.import("counter")?)
            },
        ),
    );
    fx.boot("main").await.unwrap();

    fx.loader.register(
        "child",
        module(vec![], &["counter"], |_| anyhow::bail!("boot failure")),
    );
    let status = fx.reload("child").await.unwrap();

    let UpdateStatus::EvaluationError { error, .. } = status else {
        panic!("expected evaluation error")
    };
    assert_eq!(error.url(), "child");
    // The failed replacement was reverted and the graph is still linked.
    assert_eq!(fx.export_of("child", "counter"), json!(1));
    assert_eq!(fx.export_of("main", "value"), json!(1));
    assert_eq!(main_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn orphan_is_pruned_once_and_revived_from_staging() {
    let fx = Fixture::new();
    let pruned = Arc::new(AtomicU32::new(0));

    let tracked = pruned.clone();
    fx.loader.register(
        "child",
        module(vec![], &["counter"], move |scope| {
            let tracked = tracked.clone();
            scope.hot().prune(move || {
                tracked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            scope.export("counter", json!(1))
        }),
    );
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &[],
            |scope| {
                scope.hot().accept();
                scope.import("counter").map(|_| ())
            },
        ),
    );
    fx.boot("main").await.unwrap();

    // Drop the import: the child becomes an orphan.
    fx.loader.register(
        "main",
        module(vec![], &[], |scope| {
            scope.hot().accept();
            Ok(())
        }),
    );
    let status = fx.reload("main").await.unwrap();
    assert_eq!(status.kind(), "success");
    assert_eq!(pruned.load(Ordering::SeqCst), 1);
    let child = fx.application.acquire("child");
    assert!(child.current().is_none());
    assert!(child.staging().is_some());

    // Re-import: the clone staged at prune time revives the module.
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &["value"],
            |scope| {
                scope.hot().accept();
                scope.export("value", scope.import("counter")?)
            },
        ),
    );
    let status = fx.reload("main").await.unwrap();
    assert_eq!(status.kind(), "success");
    assert_eq!(fx.export_of("main", "value"), json!(1));
    assert_eq!(pruned.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn dispose_failure_is_sticky_fatal() {
    let fx = Fixture::new();

    fx.loader.register(
        "child",
        module(vec![], &["counter"], |scope| {
            scope.hot().dispose(|_| anyhow::bail!("lost state"));
            scope.export("counter", json!(1))
        }),
    );
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &[],
            |scope| {
                scope.hot().accept();
                scope.import("counter").map(|_| ())
            },
        ),
    );
    fx.boot("main").await.unwrap();

    fx.loader.register("child", counter_module(2));
    let first = fx.reload("child").await.unwrap();
    let UpdateStatus::FatalError { error: first_error } = first else {
        panic!("expected fatal error")
    };
    assert_eq!(first_error.url(), "child");

    // Every further update short-circuits with the same record.
    fx.loader.register("child", counter_module(3));
    let second = fx.reload("child").await.unwrap();
    let UpdateStatus::FatalError { error: second_error } = second else {
        panic!("expected fatal error")
    };
    assert!(Arc::ptr_eq(&first_error, &second_error));
}

#[tokio::test(start_paused = true)]
async fn burst_of_changes_coalesces_into_one_update() {
    let fx = Fixture::new();
    let child_runs = runs();

    let make_child = |value: i64, tracked: Arc<AtomicU32>| {
        module(vec![], &["counter"], move |scope| {
            tracked.fetch_add(1, Ordering::SeqCst);
            scope.hot().accept();
            scope.export("counter", json!(value))
        })
    };
    fx.loader.register("child", make_child(1, child_runs.clone()));
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &[],
            |scope| scope.import("counter").map(|_| ()),
        ),
    );
    fx.boot("main").await.unwrap();

    // Two watcher events inside the debounce window: one dispatch using
    // the latest loaded source.
    fx.loader.register("child", make_child(2, child_runs.clone()));
    fx.application.notify_changed("child").await.unwrap();
    fx.loader.register("child", make_child(3, child_runs.clone()));
    fx.application.notify_changed("child").await.unwrap();

    let status = fx.application.request_update_result().await.unwrap();
    assert_eq!(status.kind(), "success");
    assert_eq!(child_runs.load(Ordering::SeqCst), 2);
    assert_eq!(fx.export_of("child", "counter"), json!(3));
}

// ============================================================================
// Cycles, dynamic imports, late invalidation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cyclic_component_updates_as_a_unit() {
    let fx = Fixture::new();
    let a_runs = runs();
    let b_runs = runs();
    let main_runs = runs();

    let tracked = a_runs.clone();
    fx.loader.register(
        "a",
        module(
            vec![("b", vec![ModuleBinding::import("value_b")])],
            &["value_a"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.export("value_a", json!("a"))
            },
        ),
    );
    let tracked = b_runs.clone();
    fx.loader.register(
        "b",
        module(
            vec![("a", vec![ModuleBinding::import("value_a")])],
            &["value_b"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                // The cycle partner evaluated first within the SCC.
                assert_eq!(scope.import("value_a")?, json!("a"));
                scope.export("value_b", json!("b"))
            },
        ),
    );
    let tracked = main_runs.clone();
    fx.loader.register(
        "main",
        module(
            vec![("a", vec![ModuleBinding::import("value_a")])],
            &[],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.hot().accept();
                scope.import("value_a").map(|_| ())
            },
        ),
    );
    fx.boot("main").await.unwrap();
    assert_eq!((a_runs.load(Ordering::SeqCst), b_runs.load(Ordering::SeqCst)), (1, 1));

    let tracked = b_runs.clone();
    fx.loader.register(
        "b",
        module(
            vec![("a", vec![ModuleBinding::import("value_a")])],
            &["value_b"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.export("value_b", json!("b2"))
            },
        ),
    );
    let status = fx.reload("b").await.unwrap();

    assert_eq!(status.kind(), "success");
    // The whole strongly connected component re-evaluated.
    assert_eq!(a_runs.load(Ordering::SeqCst), 2);
    assert_eq!(b_runs.load(Ordering::SeqCst), 2);
    assert_eq!(main_runs.load(Ordering::SeqCst), 2);
    assert_eq!(fx.export_of("b", "value_b"), json!("b2"));
}

#[tokio::test(start_paused = true)]
async fn mid_cycle_evaluation_error_reverts_unreached_members() {
    let fx = Fixture::new();
    let a_runs = runs();
    let b_runs = runs();
    let c_runs = runs();

    // a -> b -> c -> a, entered from main through a.
    let tracked = a_runs.clone();
    fx.loader.register(
        "a",
        module(
            vec![("b", vec![ModuleBinding::import("value_b")])],
            &["value_a"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.export("value_a", json!("a1"))
            },
        ),
    );
    let tracked = b_runs.clone();
    fx.loader.register(
        "b",
        module(
            vec![("c", vec![ModuleBinding::import("value_c")])],
            &["value_b"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.export("value_b", json!("b1"))
            },
        ),
    );
    let tracked = c_runs.clone();
    fx.loader.register(
        "c",
        module(
            vec![("a", vec![ModuleBinding::import("value_a")])],
            &["value_c"],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.export("value_c", json!("c1"))
            },
        ),
    );
    fx.loader.register(
        "main",
        module(
            vec![("a", vec![ModuleBinding::import("value_a")])],
            &[],
            |scope| {
                scope.hot().accept();
                scope.import("value_a").map(|_| ())
            },
        ),
    );
    fx.boot("main").await.unwrap();

    // The replacement for b throws. Members evaluate in discovery order
    // (a, b, c), so a finishes, b throws, and c is never reached.
    fx.loader.register(
        "b",
        module(
            vec![("c", vec![ModuleBinding::import("value_c")])],
            &["value_b"],
            |_| anyhow::bail!("mid-cycle failure"),
        ),
    );
    let status = fx.reload("b").await.unwrap();

    let UpdateStatus::EvaluationError { error, .. } = status else {
        panic!("expected evaluation error")
    };
    assert_eq!(error.url(), "b");
    // Both the thrower and the never-reached member revert to their
    // previous instances; no importer can observe placeholder exports.
    assert_eq!(fx.export_of("b", "value_b"), json!("b1"));
    assert_eq!(fx.export_of("c", "value_c"), json!("c1"));
    assert_eq!(fx.export_of("a", "value_a"), json!("a1"));
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);
    assert_eq!(c_runs.load(Ordering::SeqCst), 1);
    // The member evaluated before the throw keeps its replacement.
    assert_eq!(a_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn dynamic_import_edges_join_the_update_graph() {
    let fx = Fixture::new();
    let main_runs = runs();

    fx.loader.register(
        "dyn",
        module(vec![], &["x"], |scope| scope.export("x", json!(1))),
    );
    let tracked = main_runs.clone();
    fx.loader.register(
        "main",
        module_async(vec![], &["seen"], move |scope| {
            let tracked = tracked.clone();
            Box::pin(async move {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.hot().accept();
                let namespace = scope.dynamic_import("dyn").await?;
                scope.export("seen", namespace["x"].clone())
            })
        }),
    );
    fx.boot("main").await.unwrap();
    assert_eq!(fx.export_of("main", "seen"), json!(1));

    fx.loader.register(
        "dyn",
        module(vec![], &["x"], |scope| scope.export("x", json!(2))),
    );
    let status = fx.reload("dyn").await.unwrap();

    // The dynamically imported module is part of the reachable graph, so
    // the self-accepting importer re-ran against the new version.
    assert_eq!(status.kind(), "success");
    assert_eq!(main_runs.load(Ordering::SeqCst), 2);
    assert_eq!(fx.export_of("main", "seen"), json!(2));
}

#[tokio::test(start_paused = true)]
async fn self_accept_throw_surfaces_as_unaccepted_evaluation() {
    let fx = Fixture::new();
    let main_runs = runs();

    fx.loader.register(
        "child",
        module(vec![], &["counter"], |scope| {
            scope.hot().accept_with(|_| anyhow::bail!("cannot adapt"));
            scope.export("counter", json!(1))
        }),
    );
    let tracked = main_runs.clone();
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("counter")])],
            &[],
            move |scope| {
                tracked.fetch_add(1, Ordering::SeqCst);
                scope.import("counter").map(|_| ())
            },
        ),
    );
    fx.boot("main").await.unwrap();

    // The dry run trusts the self-accept; the callback then throws during
    // commit and the invalidation climbs to the (un-accepting) root.
    fx.loader.register("child", counter_module(2));
    let status = fx.reload("child").await.unwrap();

    assert_eq!(status.kind(), "unacceptedEvaluation");
    // The update is committed regardless.
    assert_eq!(main_runs.load(Ordering::SeqCst), 2);
    assert_eq!(fx.export_of("child", "counter"), json!(2));
}

// ============================================================================
// Export surface: stars, indirects, namespaces, dispose data
// ============================================================================

fn hub(entries: Vec<(&str, Vec<ModuleBinding>)>) -> ModuleSource {
    module(entries, &[], |_| Ok(()))
}

#[tokio::test(start_paused = true)]
async fn star_reexports_resolve_through_hub() {
    let fx = Fixture::new();

    fx.loader.register(
        "a",
        module(vec![], &["x"], |scope| scope.export("x", json!("ax"))),
    );
    fx.loader.register(
        "b",
        module(vec![], &["y"], |scope| scope.export("y", json!("by"))),
    );
    fx.loader.register(
        "hub",
        hub(vec![
            ("a", vec![ModuleBinding::export_star()]),
            ("b", vec![ModuleBinding::export_star()]),
        ]),
    );
    fx.loader.register(
        "main",
        module(
            vec![(
                "hub",
                vec![ModuleBinding::import("x"), ModuleBinding::import("y")],
            )],
            &["pair"],
            |scope| {
                scope.export(
                    "pair",
                    json!([scope.import("x")?, scope.import("y")?]),
                )
            },
        ),
    );

    fx.boot("main").await.unwrap();
    assert_eq!(fx.export_of("main", "pair"), json!(["ax", "by"]));
    // The hub's namespace contains the star closure.
    assert_eq!(fx.namespace("hub"), json!({ "x": "ax", "y": "by" }));
}

#[tokio::test(start_paused = true)]
async fn ambiguous_star_export_fails_link() {
    let fx = Fixture::new();

    fx.loader.register(
        "a",
        module(vec![], &["dup"], |scope| scope.export("dup", json!(1))),
    );
    fx.loader.register(
        "b",
        module(vec![], &["dup"], |scope| scope.export("dup", json!(2))),
    );
    fx.loader.register(
        "hub",
        hub(vec![
            ("a", vec![ModuleBinding::export_star()]),
            ("b", vec![ModuleBinding::export_star()]),
        ]),
    );
    fx.loader.register(
        "main",
        module(
            vec![("hub", vec![ModuleBinding::import("dup")])],
            &[],
            |_| Ok(()),
        ),
    );

    let error = fx.boot("main").await.unwrap_err();
    assert!(format!("{error:#}").contains("ambiguous"));
}

#[tokio::test(start_paused = true)]
async fn indirect_export_chain_resolves() {
    let fx = Fixture::new();

    fx.loader.register(
        "a",
        module(vec![], &["inner"], |scope| {
            scope.export("inner", json!("deep"))
        }),
    );
    fx.loader.register(
        "hub",
        hub(vec![(
            "a",
            vec![ModuleBinding::indirect_export_as("inner", "outer")],
        )]),
    );
    fx.loader.register(
        "main",
        module(
            vec![("hub", vec![ModuleBinding::import("outer")])],
            &["got"],
            |scope| scope.export("got", scope.import("outer")?),
        ),
    );

    fx.boot("main").await.unwrap();
    assert_eq!(fx.export_of("main", "got"), json!("deep"));
}

#[tokio::test(start_paused = true)]
async fn namespace_import_binds_whole_module() {
    let fx = Fixture::new();

    fx.loader.register("child", counter_module(7));
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import_star("ns")])],
            &["snapshot"],
            |scope| scope.export("snapshot", scope.import("ns")?),
        ),
    );

    fx.boot("main").await.unwrap();
    assert_eq!(fx.export_of("main", "snapshot"), json!({ "counter": 7 }));
}

#[tokio::test(start_paused = true)]
async fn dispose_data_carries_into_the_successor() {
    let fx = Fixture::new();

    fx.loader.register(
        "child",
        module(vec![], &["total"], |scope| {
            scope.hot().dispose(|data| {
                data["carried"] = json!(41);
                Ok(())
            });
            // First generation: no predecessor data.
            assert!(scope.hot().data().is_none());
            scope.export("total", json!(1))
        }),
    );
    fx.loader.register(
        "main",
        module(
            vec![("child", vec![ModuleBinding::import("total")])],
            &[],
            |scope| {
                scope.hot().accept();
                scope.import("total").map(|_| ())
            },
        ),
    );
    fx.boot("main").await.unwrap();

    fx.loader.register(
        "child",
        module(vec![], &["total"], |scope| {
            let carried = scope
                .hot()
                .data()
                .map(|data| data["carried"].clone())
                .unwrap_or(json!(0));
            scope.export("total", json!(carried.as_i64().unwrap_or(0) + 1))
        }),
    );
    let status = fx.reload("child").await.unwrap();

    assert_eq!(status.kind(), "success");
    assert_eq!(fx.export_of("child", "total"), json!(42));
}
