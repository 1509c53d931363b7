//! Builders for SCIP indexes used in tests.
//!
//! [`sample_index`] is a small TypeScript project: eleven files, one package
//! defined by the upload and eight npm dependencies it references. Several
//! files are split into multiple document fragments, the way large indexers
//! emit them.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

use crate::scip::{
    Document, Index, Metadata, Occurrence, Relationship, SymbolInformation, TextEncoding,
    ToolInfo, SYMBOL_ROLE_DEFINITION, SYMBOL_ROLE_READ_ACCESS,
};

pub const SAMPLE_TOOL_NAME: &str = "scip-typescript";
pub const SAMPLE_TOOL_VERSION: &str = "0.3.11";
pub const SAMPLE_SCHEME: &str = "scip-typescript";
pub const SAMPLE_MANAGER: &str = "npm";
pub const SAMPLE_PACKAGE: (&str, &str) = ("template", "0.0.0-DEVELOPMENT");

/// Packages referenced by [`sample_index`], as `(name, version)`.
pub const SAMPLE_DEPENDENCIES: [(&str, &str); 8] = [
    ("typescript", "4.9.5"),
    ("@types/node", "18.11.9"),
    ("vscode-jsonrpc", "8.0.2"),
    ("lodash", "4.17.21"),
    ("rxjs", "7.8.0"),
    ("semver", "7.3.8"),
    ("chalk", "5.2.0"),
    ("yargs", "17.6.2"),
];

/// Distinct document paths of [`sample_index`].
pub const SAMPLE_PATHS: [&str; 11] = [
    "src/index.ts",
    "src/util.ts",
    "src/config.ts",
    "src/log.ts",
    "src/parser/ast.ts",
    "src/parser/lexer.ts",
    "src/parser/mod.ts",
    "src/emit/writer.ts",
    "src/emit/format.ts",
    "test/index.test.ts",
    "test/util.test.ts",
];

/// Incrementally assembles an [`Index`].
#[derive(Debug, Clone, Default)]
pub struct IndexBuilder {
    index: Index,
}

impl IndexBuilder {
    pub fn new(tool_name: &str, tool_version: &str) -> Self {
        Self {
            index: Index {
                metadata: Some(Metadata {
                    version: 0,
                    tool_info: Some(ToolInfo {
                        name: tool_name.to_string(),
                        version: tool_version.to_string(),
                        arguments: Vec::new(),
                    }),
                    project_root: "file:///src".to_string(),
                    text_document_encoding: TextEncoding::Utf8 as i32,
                }),
                ..Default::default()
            },
        }
    }

    /// An index with no metadata entry.
    pub fn without_metadata() -> Self {
        Self::default()
    }

    pub fn arguments(mut self, arguments: &[&str]) -> Self {
        if let Some(tool) = self
            .index
            .metadata
            .as_mut()
            .and_then(|metadata| metadata.tool_info.as_mut())
        {
            tool.arguments = arguments.iter().map(|a| a.to_string()).collect();
        }
        self
    }

    pub fn document(mut self, document: Document) -> Self {
        self.index.documents.push(document);
        self
    }

    pub fn external_symbol(mut self, symbol: SymbolInformation) -> Self {
        self.index.external_symbols.push(symbol);
        self
    }

    pub fn build(self) -> Index {
        self.index
    }

    pub fn encode(self) -> Vec<u8> {
        self.index.encode_to_vec()
    }

    pub fn encode_gzipped(self) -> Vec<u8> {
        gzip(&self.index.encode_to_vec())
    }
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(bytes);
    encoder.finish().unwrap_or_default()
}

/// A global symbol in the `npm` manager of the sample scheme.
pub fn npm_symbol(package: &str, version: &str, descriptors: &str) -> String {
    format!(
        "{} {} {} {} {}",
        SAMPLE_SCHEME, SAMPLE_MANAGER, package, version, descriptors
    )
}

/// A symbol of the package defined by [`sample_index`].
pub fn local_package_symbol(descriptors: &str) -> String {
    npm_symbol(SAMPLE_PACKAGE.0, SAMPLE_PACKAGE.1, descriptors)
}

pub fn document(path: &str, occurrences: Vec<Occurrence>) -> Document {
    Document {
        relative_path: path.to_string(),
        language: "TypeScript".to_string(),
        occurrences,
        ..Default::default()
    }
}

pub fn definition(symbol: &str, line: i32) -> Occurrence {
    Occurrence {
        range: vec![line, 0, line, 8],
        symbol: symbol.to_string(),
        symbol_roles: SYMBOL_ROLE_DEFINITION,
        ..Default::default()
    }
}

pub fn reference(symbol: &str, line: i32) -> Occurrence {
    Occurrence {
        range: vec![line, 4, 12],
        symbol: symbol.to_string(),
        symbol_roles: SYMBOL_ROLE_READ_ACCESS,
        ..Default::default()
    }
}

pub fn symbol_info(symbol: &str, documentation: &str) -> SymbolInformation {
    SymbolInformation {
        symbol: symbol.to_string(),
        documentation: vec![documentation.to_string()],
        ..Default::default()
    }
}

pub fn implements(mut info: SymbolInformation, target: &str) -> SymbolInformation {
    info.relationships.push(Relationship {
        symbol: target.to_string(),
        is_implementation: true,
        ..Default::default()
    });
    info
}

fn dependency_symbol(index: usize, descriptors: &str) -> String {
    let (name, version) = SAMPLE_DEPENDENCIES[index];
    npm_symbol(name, version, descriptors)
}

/// The sample project described in the module docs.
///
/// Every file defines at least one symbol of the `template` package; each of
/// the eight dependencies is referenced from at least one file and declared
/// as an external symbol. `rxjs` symbols relate to each other so resolving
/// them exercises transitive injection.
pub fn sample_index() -> Index {
    let own = local_package_symbol;
    let dep = dependency_symbol;

    let main = own("src/`index.ts`/main().");
    let util = own("src/`util.ts`/debounceAll().");
    let config = own("src/`config.ts`/Config#");
    let log = own("src/`log.ts`/logger.");
    let ast = own("src/parser/`ast.ts`/Node#");
    let lexer = own("src/parser/`lexer.ts`/Lexer#");
    let parse = own("src/parser/`mod.ts`/parse().");
    let writer = own("src/emit/`writer.ts`/Writer#");
    let format = own("src/emit/`format.ts`/format().");

    let ts_program = dep(0, "lib/`typescript.d.ts`/ts/Program#");
    let node_fs = dep(1, "`fs.d.ts`/readFileSync().");
    let jsonrpc = dep(2, "lib/common/`connection.d.ts`/MessageConnection#");
    let lodash = dep(3, "`index.d.ts`/debounce().");
    let observable = dep(4, "dist/types/internal/`Observable.d.ts`/Observable#");
    let subscribable = dep(4, "dist/types/internal/`types.d.ts`/Subscribable#");
    let interop = dep(4, "dist/types/internal/`types.d.ts`/InteropObservable#");
    let semver = dep(5, "`index.d.ts`/satisfies().");
    let chalk = dep(6, "source/`index.d.ts`/chalk.");
    let yargs = dep(7, "`index.d.ts`/Argv#");

    IndexBuilder::new(SAMPLE_TOOL_NAME, SAMPLE_TOOL_VERSION)
        .arguments(&["index", "--infer-tsconfig"])
        .document(document(
            "src/index.ts",
            vec![
                definition(&main, 3),
                reference(&config, 5),
                reference(&yargs, 6),
                definition("local 0", 7),
                reference("local 0", 8),
            ],
        ))
        .document(document(
            "src/util.ts",
            vec![definition(&util, 1), reference(&lodash, 2)],
        ))
        .document(document(
            "src/config.ts",
            vec![definition(&config, 0), reference(&semver, 4), reference(&node_fs, 6)],
        ))
        .document(document(
            "src/parser/ast.ts",
            vec![definition(&ast, 0), reference(&ts_program, 2)],
        ))
        .document(document(
            "src/log.ts",
            vec![definition(&log, 0), reference(&chalk, 1)],
        ))
        .document(document(
            "src/index.ts",
            vec![reference(&parse, 10), reference(&writer, 11), reference(&log, 12)],
        ))
        .document(document(
            "src/parser/lexer.ts",
            vec![definition(&lexer, 0), reference(&observable, 3)],
        ))
        .document(document(
            "src/parser/ast.ts",
            vec![reference(&lexer, 9), reference(&ts_program, 10)],
        ))
        .document(document(
            "src/parser/mod.ts",
            vec![definition(&parse, 0), reference(&ast, 1), reference(&lexer, 2)],
        ))
        .document(document(
            "src/emit/writer.ts",
            vec![definition(&writer, 0), reference(&jsonrpc, 5)],
        ))
        .document(document(
            "src/emit/format.ts",
            vec![definition(&format, 0), reference(&writer, 1)],
        ))
        .document(document(
            "test/index.test.ts",
            vec![
                definition(&own("test/`index.test.ts`/suite."), 0),
                reference(&main, 2),
            ],
        ))
        .document(document(
            "src/parser/ast.ts",
            vec![reference(&ast, 20)],
        ))
        .document(document(
            "test/util.test.ts",
            vec![
                definition(&own("test/`util.test.ts`/suite."), 0),
                reference(&util, 2),
            ],
        ))
        .external_symbol(symbol_info(&ts_program, "The TypeScript program."))
        .external_symbol(symbol_info(&node_fs, "Synchronously reads a file."))
        .external_symbol(symbol_info(&jsonrpc, "A JSON-RPC connection."))
        .external_symbol(symbol_info(&lodash, "Creates a debounced function."))
        .external_symbol(implements(
            symbol_info(&observable, "A representation of any set of values."),
            &subscribable,
        ))
        .external_symbol(implements(
            symbol_info(&subscribable, "Anything that can be subscribed to."),
            &interop,
        ))
        .external_symbol(symbol_info(&interop, "An object with Symbol.observable."))
        .external_symbol(symbol_info(&semver, "Checks a version against a range."))
        .external_symbol(symbol_info(&chalk, "Terminal string styling."))
        .external_symbol(symbol_info(&yargs, "The argument parser."))
        .build()
}

/// [`sample_index`], serialized and gzip-compressed.
pub fn sample_upload() -> Vec<u8> {
    gzip(&sample_index().encode_to_vec())
}
