// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Procedural macros wrapping tests with [`msd_test_utils::TestLoggerGuard`].
//!
//! The wrapped body sees a `logger: &mut TestLogger` binding. The guard
//! records success when the body returns normally (or `Ok`) and failure on
//! panic or `Err`.

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::{ItemFn, ReturnType, Type, parse_macro_input, spanned::Spanned};

/// Attribute macro for synchronous tests.
///
/// ```rust,ignore
/// #[msd_test_utils::logged_test]
/// fn decodes_empty_frame() {
///     logger.log("running").unwrap();
/// }
/// ```
#[proc_macro_attribute]
pub fn logged_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            Span::call_site(),
            "#[logged_test] does not accept arguments",
        )
        .to_compile_error()
        .into();
    }

    let input = parse_macro_input!(item as ItemFn);

    if let Some(async_token) = &input.sig.asyncness {
        return syn::Error::new(
            async_token.span(),
            "#[logged_test] cannot be applied to async functions; use #[logged_tokio_test] instead",
        )
        .to_compile_error()
        .into();
    }

    expand(input, quote! { #[::core::prelude::v1::test] }, "logged_test")
}

/// Attribute macro for asynchronous Tokio tests.
///
/// Arguments are forwarded to `#[tokio::test]`, e.g.
/// `#[logged_tokio_test(flavor = "multi_thread")]`.
#[proc_macro_attribute]
pub fn logged_tokio_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = TokenStream2::from(attr);
    let input = parse_macro_input!(item as ItemFn);

    if input.sig.asyncness.is_none() {
        return syn::Error::new(
            input.sig.ident.span(),
            "#[logged_tokio_test] requires an async function",
        )
        .to_compile_error()
        .into();
    }

    let harness = if args.is_empty() {
        quote! { #[::tokio::test] }
    } else {
        quote! { #[::tokio::test( #args )] }
    };

    expand(input, harness, "logged_tokio_test")
}

fn expand(mut input: ItemFn, harness: TokenStream2, macro_name: &str) -> TokenStream {
    input.attrs.retain(|attr| !is_logged_attr(attr));

    let fn_ident = &input.sig.ident;
    if !input.sig.inputs.is_empty() {
        return syn::Error::new(
            fn_ident.span(),
            format!("#[{macro_name}] can only be applied to functions without parameters"),
        )
        .to_compile_error()
        .into();
    }

    let fn_name = fn_ident.to_string();
    let visibility = &input.vis;
    let asyncness = &input.sig.asyncness;
    let generics = &input.sig.generics;
    let output = &input.sig.output;
    let block = &input.block;
    let other_attrs = &input.attrs;
    let finish = finish_body(output);

    let expanded = quote! {
        #harness
        #(#other_attrs)*
        #visibility #asyncness fn #fn_ident #generics () #output {
            let mut __guard = ::msd_test_utils::TestLoggerGuard::new(#fn_name)
                .expect("failed to create TestLogger");
            let mut logger = __guard.logger();
            let _ = &mut logger;

            let inner_result = #block;
            drop(logger);
            #finish
        }
    };

    expanded.into()
}

fn finish_body(output: &ReturnType) -> TokenStream2 {
    match output {
        ReturnType::Type(_, ty) if is_result_type(ty) => quote! {
            match inner_result {
                ::std::result::Result::Ok(value) => {
                    if let Err(e) = __guard.finish_success() {
                        panic!("failed to finalize TestLogger: {}", e);
                    }
                    ::std::result::Result::Ok(value)
                }
                ::std::result::Result::Err(err) => {
                    let __err_msg = format!("{:?}", err);
                    if let Err(e) = __guard.finish_failure(&__err_msg) {
                        eprintln!("failed to finalize TestLogger after error: {}", e);
                    }
                    ::std::result::Result::Err(err)
                }
            }
        },
        _ => quote! {
            if let Err(e) = __guard.finish_success() {
                panic!("failed to finalize TestLogger: {}", e);
            }
            inner_result
        },
    }
}

fn is_result_type(ty: &Type) -> bool {
    match ty {
        Type::Path(type_path) => {
            type_path.path.segments.last().is_some_and(|segment| segment.ident == "Result")
        }
        _ => false,
    }
}

fn is_logged_attr(attr: &syn::Attribute) -> bool {
    attr.path()
        .segments
        .last()
        .is_some_and(|segment| segment.ident == "logged_test" || segment.ident == "logged_tokio_test")
}
