mod utils;

use proc_macro::TokenStream;

/// Builds a `SeriesWork` from its tasks, in order.
///
/// Every argument is an expression evaluating to a boxed task. The first
/// one starts the series; the rest are pushed behind it. The result is the
/// `Arc<SeriesWork>`, not started yet.
///
/// # Examples
///
/// ```rust,ignore
/// let series = weft::series!(fetch, parse, store);
/// series.run();
/// ```
#[proc_macro]
pub fn series(input: TokenStream) -> TokenStream {
    let args = utils::split_args(input);

    let Some((first, rest)) = args.split_first() else {
        return utils::compile_error("series! needs at least one task");
    };

    let mut output = String::new();
    output.push_str("{\n");
    output.push_str(&format!(
        "let __series = ::weft::task::SeriesWork::new({}, ::core::option::Option::None);\n",
        utils::tokens_to_string(first)
    ));

    for task in rest {
        output.push_str(&format!(
            "__series.push_back({});\n",
            utils::tokens_to_string(task)
        ));
    }

    output.push_str("__series\n");
    output.push_str("}\n");

    utils::parse_or_error("series", &output)
}

/// Builds a `ParallelWork` over the given series.
///
/// Every argument is an expression evaluating to an `Arc<SeriesWork>`.
/// Expands to `ParallelWork::with_series`, so the result is a
/// `weft::Result<Box<ParallelWork>>` that fails when a series already
/// belongs to another parallel work.
///
/// # Examples
///
/// ```rust,ignore
/// let fan_out = weft::parallel!(weft::series!(a), weft::series!(b, c))?;
/// fan_out.start();
/// ```
#[proc_macro]
pub fn parallel(input: TokenStream) -> TokenStream {
    let args = utils::split_args(input);

    let branches = args
        .iter()
        .map(|arg| utils::tokens_to_string(arg))
        .collect::<Vec<_>>()
        .join(", ");

    let output = format!(
        "::weft::task::ParallelWork::with_series(::std::vec![{branches}], ::core::option::Option::None)"
    );

    utils::parse_or_error("parallel", &output)
}
