//! Proc macros for kube-testrun
//!
//! Provides the `#[kube_testrun::test]` attribute macro.

use proc_macro::TokenStream;
use quote::quote;
use syn::{FnArg, ItemFn, Pat, PatType, ReturnType};

/// Attribute macro for tests that share a cluster.
///
/// A function taking `run: &TestRun` gets a prepared run: the cluster lock
/// is held, leftovers of earlier runs are swept, the run namespace exists
/// and the fixtures next to the test file are synthesized. The lock is
/// released when the body returns or panics.
///
/// # Example
///
/// ```ignore
/// use kube_testrun::TestRun;
///
/// #[kube_testrun::test]
/// async fn creates_configmap(run: &TestRun) {
///     let applied = run.apply_manifest(0u64).await.unwrap();
///     assert_eq!(applied[0].metadata.namespace.as_deref(), Some(run.namespace()));
/// }
/// ```
///
/// # With Result Return Type
///
/// ```ignore
/// #[kube_testrun::test]
/// async fn with_result(run: &TestRun) -> Result<(), Box<dyn std::error::Error>> {
///     run.apply_manifest(0u64).await?;
///     Ok(())
/// }
/// ```
///
/// # Environment Variables
///
/// - `TESTRUN_KEEP_LOCK=true` - keep the lock file after the test (debugging)
/// - every `TESTRUN_*` variable read by `RunConfig::from_env`
#[proc_macro_attribute]
pub fn test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input_fn = syn::parse_macro_input!(item as ItemFn);
    test_impl(&input_fn).into()
}

/// Check if a function has a parameter named "run"
fn has_run_param(input_fn: &ItemFn) -> bool {
    input_fn.sig.inputs.iter().any(|arg| {
        if let FnArg::Typed(PatType { pat, .. }) = arg {
            if let Pat::Ident(ident) = pat.as_ref() {
                return ident.ident == "run";
            }
        }
        false
    })
}

/// Check if a function has an explicit return type (e.g., `-> Result<...>`)
fn has_result_return(input_fn: &ItemFn) -> bool {
    matches!(&input_fn.sig.output, ReturnType::Type(..))
}

/// Inner implementation that works with `proc_macro2` types for testability
fn test_impl(input_fn: &ItemFn) -> proc_macro2::TokenStream {
    let fn_name = &input_fn.sig.ident;
    let fn_block = &input_fn.block;
    let fn_vis = &input_fn.vis;
    let fn_attrs = &input_fn.attrs;

    if !has_run_param(input_fn) {
        return quote! {
            #(#fn_attrs)*
            #[::kube_testrun::__private::tokio::test(crate = "::kube_testrun::__private::tokio")]
            #fn_vis async fn #fn_name() {
                #fn_block
            }
        };
    }

    // The original function, nested so its signature types the body
    let fn_sig = &input_fn.sig;
    let body = if has_result_return(input_fn) {
        quote! {
            #fn_name(run).await.map_err(|e| format!("{:?}", e))
        }
    } else {
        quote! {
            #fn_name(run).await;
            Ok::<(), String>(())
        }
    };

    quote! {
        #(#fn_attrs)*
        #[::kube_testrun::__private::tokio::test(crate = "::kube_testrun::__private::tokio")]
        #fn_vis async fn #fn_name() {
            #fn_sig #fn_block

            use ::kube_testrun::__private::FutureExt;
            use ::std::panic::AssertUnwindSafe;

            ::kube_testrun::telemetry::init_test_logging();

            let source = ::kube_testrun::identity::locate_source(env!("CARGO_MANIFEST_DIR"), file!())
                .unwrap_or_else(|| panic!("[kube-testrun] cannot locate test source {}", file!()));
            let owned_run = ::kube_testrun::TestRun::connect(&source)
                .await
                .unwrap_or_else(|e| panic!("[kube-testrun] failed to start test run: {}", e));

            if let Err(e) = owned_run.prepare().await {
                owned_run.release().await;
                panic!("[kube-testrun] failed to prepare test run: {}", e);
            }

            let run: &::kube_testrun::TestRun = &owned_run;
            let result = AssertUnwindSafe(async { #body }).catch_unwind().await;

            if ::kube_testrun::config::keep_lock() {
                eprintln!(
                    "[kube-testrun] TESTRUN_KEEP_LOCK set - keeping {}",
                    run.identity().lock_path().display()
                );
            } else {
                run.release().await;
            }

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => panic!("[kube-testrun] test returned error: {}", e),
                Err(panic_info) => ::std::panic::resume_unwind(panic_info),
            }
        }
    }
}
