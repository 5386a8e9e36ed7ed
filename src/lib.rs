//! A small scripting language for stepping through programs and watching
//! their scopes: lexer, error-recovering parser, chained environments and a
//! resumable tree-walking interpreter.

pub mod script;
