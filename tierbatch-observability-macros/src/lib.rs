//! `#[obs]` attaches a debug-level `tracing::instrument` span to async backend
//! and orchestrator methods when the calling crate enables `observability`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

#[proc_macro_attribute]
pub fn obs(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item = parse_macro_input!(input as ItemFn);
    let args = proc_macro2::TokenStream::from(args);
    let attr = if args.is_empty() {
        syn::parse_quote!(
            #[cfg_attr(feature = "observability", tracing::instrument(level = "debug", skip_all))]
        )
    } else {
        // Caller-provided fields are recorded on top of the skipped arguments.
        syn::parse_quote!(
            #[cfg_attr(feature = "observability", tracing::instrument(level = "debug", skip_all, #args))]
        )
    };
    item.attrs.push(attr);
    TokenStream::from(quote!(#item))
}
