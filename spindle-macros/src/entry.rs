//! Entry-point macros for spindle
use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const KNOWN_ATTRIBUTES: &str = "`flavor`, `pool_size`, `name`";

/// Config used in case of the attribute not being able to build a valid config
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    flavor: DispatcherFlavor::Pooled,
    pool_size: None,
    name: None,
};

/// For quickstart on how this works, let's analyze this example:
///
/// ```rust,no_run
/// #[spindle::main(flavor = "pooled", pool_size = 2)]
/// async fn main(scope: spindle::Scope) -> spindle::Result<()> {
///     println!("Hello world");
///     Ok(())
/// }
/// ```
///
/// The compiler splits the tokens where args is everything between the
/// proc_macro parentheses:
/// - `flavor = "pooled", pool_size = 2`
///
/// And item is the async function whose body becomes the root task:
/// ```no_compile
/// async fn main(scope: spindle::Scope) -> spindle::Result<()> {
///     println!("Hello world");
///     Ok(())
/// }
/// ```
pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    // If any of the steps for this macro fail, we still want to expand to an item that is as close
    // to the expected output as possible. This helps out IDEs such that completions and other
    // related features keep working.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = AttributeArgs::parse_terminated
        .parse2(args)
        .and_then(|args| build_config(&input, args, false));

    expand(item, input, false, config)
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, true))
    };

    expand(item, input, true, config)
}

fn expand(
    item: TokenStream,
    input: ItemFn,
    is_test: bool,
    config: Result<FinalConfig, syn::Error>,
) -> TokenStream {
    match (config, scope_argument(&input.sig)) {
        (Ok(config), Ok(arg)) => parse_knobs(input, is_test, config, arg),
        (Err(e), Ok(arg)) => {
            token_stream_with_error(parse_knobs(input, is_test, DEFAULT_ERROR_CONFIG, arg), e)
        }
        // Without a scope argument there is no closure to expand into.
        (_, Err(e)) => token_stream_with_error(item, e),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum DispatcherFlavor {
    Pooled,
    Pinned,
    Unconfined,
}

impl DispatcherFlavor {
    fn from_str(s: &str) -> Result<DispatcherFlavor, String> {
        match s {
            "pooled" => Ok(DispatcherFlavor::Pooled),
            "pinned" => Ok(DispatcherFlavor::Pinned),
            "unconfined" => Ok(DispatcherFlavor::Unconfined),
            _ => Err(format!(
                "No such dispatcher flavor `{s}`. The dispatcher flavors are `pooled`, `pinned` and `unconfined`."
            )),
        }
    }
}

struct FinalConfig {
    flavor: DispatcherFlavor,
    pool_size: Option<usize>,
    name: Option<String>,
}

struct ConfigBuilder {
    flavor: Option<DispatcherFlavor>,
    pool_size: Option<(usize, Span)>,
    name: Option<String>,
    is_test: bool,
}

impl ConfigBuilder {
    fn new(is_test: bool) -> Self {
        ConfigBuilder {
            flavor: None,
            pool_size: None,
            name: None,
            is_test,
        }
    }

    fn macro_name(&self) -> &'static str {
        if self.is_test {
            "spindle::test"
        } else {
            "spindle::main"
        }
    }

    fn set_flavor(&mut self, flavor: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.flavor.is_some() {
            return Err(syn::Error::new(span, "`flavor` set multiple times."));
        }

        let flavor_str = parse_string(flavor, span, "flavor")?;
        let flavor =
            DispatcherFlavor::from_str(&flavor_str).map_err(|err| syn::Error::new(span, err))?;
        self.flavor = Some(flavor);

        Ok(())
    }

    fn set_pool_size(&mut self, pool_size: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.pool_size.is_some() {
            return Err(syn::Error::new(span, "`pool_size` set multiple times."));
        }

        let pool_size = parse_int(pool_size, span, "pool_size")?;
        if pool_size == 0 {
            return Err(syn::Error::new(span, "`pool_size` may not be 0."));
        }
        self.pool_size = Some((pool_size, span));

        Ok(())
    }

    fn set_name(&mut self, name: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.name.is_some() {
            return Err(syn::Error::new(span, "`name` set multiple times."));
        }

        let name = parse_string(name, span, "name")?;
        if name.is_empty() {
            return Err(syn::Error::new(span, "`name` may not be empty."));
        }
        self.name = Some(name);

        Ok(())
    }

    fn build(&self) -> Result<FinalConfig, syn::Error> {
        let flavor = self.flavor.unwrap_or(DispatcherFlavor::Pooled);

        let pool_size = match (flavor, self.pool_size) {
            (DispatcherFlavor::Pooled, Some((pool_size, _))) => Some(pool_size),
            (_, Some((_, span))) => {
                let msg = format!(
                    "The `pool_size` option requires the `pooled` dispatcher flavor. Use `#[{}(flavor = \"pooled\")]`",
                    self.macro_name(),
                );
                return Err(syn::Error::new(span, msg));
            }
            (_, None) => None,
        };

        Ok(FinalConfig {
            flavor,
            pool_size,
            name: self.name.clone(),
        })
    }
}

fn build_config(
    input: &ItemFn,
    args: AttributeArgs,
    is_test: bool,
) -> Result<FinalConfig, syn::Error> {
    if input.sig.asyncness.is_none() {
        let msg = "the `async` keyword is missing from the function declaration";
        return Err(syn::Error::new_spanned(input.sig.fn_token, msg));
    }

    if matches!(input.sig.output, syn::ReturnType::Default) {
        let msg = "the function must return `spindle::Result<T>`";
        return Err(syn::Error::new_spanned(&input.sig.ident, msg));
    }

    let mut config = ConfigBuilder::new(is_test);

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                let span = syn::spanned::Spanned::span(lit);
                match ident.as_str() {
                    "flavor" => config.set_flavor(lit.clone(), span)?,
                    "pool_size" => config.set_pool_size(lit.clone(), span)?,
                    "name" => config.set_name(lit.clone(), span)?,
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected one of: {KNOWN_ATTRIBUTES}",
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "pooled" | "pinned" | "unconfined" => format!(
                        "Set the dispatcher flavor with #[{}(flavor = \"{name}\")].",
                        config.macro_name()
                    ),
                    "flavor" | "pool_size" | "name" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    name => format!(
                        "Unknown attribute {name} is specified; expected one of: {KNOWN_ATTRIBUTES}."
                    ),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    config.build()
}

fn parse_knobs(
    input: ItemFn,
    is_test: bool,
    config: FinalConfig,
    scope_arg: syn::PatType,
) -> TokenStream {
    // If type mismatch occurs, the current rustc points to the last statement.
    let (last_stmt_start_span, last_stmt_end_span) = {
        let mut last_stmt = input.stmts.last().cloned().unwrap_or_default().into_iter();

        let start = last_stmt.next().map_or_else(Span::call_site, |t| t.span());
        let end = last_stmt.last().map_or(start, |t| t.span());
        (start, end)
    };

    let mut dispatcher = match config.flavor {
        DispatcherFlavor::Pooled => quote_spanned! {last_stmt_start_span=>
            spindle::runtime::Builder::new_pooled()
        },
        DispatcherFlavor::Pinned => {
            let name = config.name.clone().unwrap_or_else(|| input.sig.ident.to_string());
            quote_spanned! {last_stmt_start_span=>
                spindle::runtime::Builder::new_pinned(#name)
            }
        }
        DispatcherFlavor::Unconfined => quote_spanned! {last_stmt_start_span=>
            spindle::runtime::Builder::new_unconfined()
        },
    };

    if let Some(v) = config.pool_size {
        dispatcher = quote_spanned! {last_stmt_start_span=> #dispatcher.pool_size(#v) };
    }

    if let (Some(name), false) = (&config.name, config.flavor == DispatcherFlavor::Pinned) {
        dispatcher = quote_spanned! {last_stmt_start_span=> #dispatcher.name(#name) };
    }

    let generated_attrs = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let output_type = match &input.sig.output {
        syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
        syn::ReturnType::Default => quote! { spindle::Result<()> },
    };

    // Pinning the output type down here keeps `?` inside the body inferable.
    let body = input.body();
    let body = quote! {
        let body = move |#scope_arg| async move {
            let out: #output_type = async move #body.await;
            out
        };
    };

    // This explicit `return` is intentional. See tokio-rs/tokio#4636
    let last_block = quote_spanned! {last_stmt_end_span=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            let dispatcher = #dispatcher
                .try_build()
                .expect("Failed building the Dispatcher");
            let res = dispatcher.run_blocking(body);
            dispatcher.shutdown();
            return res;
        }
    };

    input.into_tokens(generated_attrs, body, last_block)
}
