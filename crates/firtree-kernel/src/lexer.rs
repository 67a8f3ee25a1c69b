//! Kernel-language tokens.
//!
//! We also define a `logos` lexer for the token nodes.

use logos::Logos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Logos)]
#[allow(non_camel_case_types)]
pub enum Token<'a> {
    //
    // Punctuation
    //
    #[token("(")]
    L_PAREN,
    #[token(")")]
    R_PAREN,
    #[token("{")]
    L_CURLY,
    #[token("}")]
    R_CURLY,
    #[token("[")]
    L_BRACK,
    #[token("]")]
    R_BRACK,
    #[token(",")]
    COMMA,
    #[token(".")]
    DOT,
    #[token(";")]
    SEMICOLON,
    #[token("?")]
    QUESTION,
    #[token(":")]
    COLON,
    #[token("++")]
    PLUSPLUS,
    #[token("--")]
    MINUSMINUS,
    #[token("+")]
    PLUS,
    #[token("-")]
    MINUS,
    #[token("*")]
    STAR,
    #[token("/")]
    SLASH,
    #[token("%")]
    PERCENT,
    #[token("!")]
    BANG,
    #[token("<")]
    L_ANGLE,
    #[token(">")]
    R_ANGLE,
    #[token("<=")]
    LTEQ,
    #[token(">=")]
    GTEQ,
    #[token("==")]
    EQ2,
    #[token("!=")]
    NEQ,
    #[token("&&")]
    AMP2,
    #[token("||")]
    PIPE2,
    #[token("=")]
    EQ,
    #[token("+=")]
    PLUSEQ,
    #[token("-=")]
    MINUSEQ,
    #[token("*=")]
    STAREQ,
    #[token("/=")]
    SLASHEQ,

    //
    // Keywords
    //
    #[token("kernel")]
    KERNEL_KW,
    #[token("const")]
    CONST_KW,
    #[token("static")]
    STATIC_KW,
    #[token("in")]
    IN_KW,
    #[token("out")]
    OUT_KW,
    #[token("inout")]
    INOUT_KW,
    #[token("if")]
    IF_KW,
    #[token("else")]
    ELSE_KW,
    #[token("for")]
    FOR_KW,
    #[token("while")]
    WHILE_KW,
    #[token("do")]
    DO_KW,
    #[token("return")]
    RETURN_KW,
    #[token("break")]
    BREAK_KW,
    #[token("continue")]
    CONTINUE_KW,
    #[token("true")]
    TRUE_KW,
    #[token("false")]
    FALSE_KW,
    #[token("void")]
    VOID_KW,
    #[token("bool")]
    BOOL_KW,
    #[token("int")]
    INT_KW,
    #[token("float")]
    FLOAT_KW,
    #[token("vec2")]
    VEC2_KW,
    #[token("vec3")]
    VEC3_KW,
    #[token("vec4")]
    VEC4_KW,
    #[token("mat2")]
    MAT2_KW,
    #[token("mat3")]
    MAT3_KW,
    #[token("mat4")]
    MAT4_KW,
    #[token("sampler")]
    SAMPLER_KW,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    IDENT(&'a str),

    #[regex(r"0b[0-1]+")]
    #[regex(r"0o[0-7]+")]
    #[regex(r"[0-9]+")]
    #[regex(r"0[xX][0-9A-Fa-f]+")]
    INT_NUMBER(&'a str),

    #[regex("[0-9]+[.]")]
    #[regex("[0-9]+(?:[eE][+-]?[0-9]+)")]
    #[regex("[0-9]*[.][0-9]+(?:[eE][+-]?[0-9]+)?")]
    FLOAT_NUMBER(&'a str),

    #[regex("//.*", logos::skip)]
    LINE_COMMENT,
    #[regex(r"/\*([^*]|\*[^/])+\*/", logos::skip)]
    BLOCK_COMMENT,
    #[regex("[ \t\r\n]+", logos::skip)]
    WHITESPACE,

    #[error]
    LEXER_ERROR,
}

impl Token<'_> {
    /// The type named by a type keyword, if any.
    pub fn type_keyword(&self) -> Option<firtree_ir::Type> {
        use firtree_ir::Type;
        Some(match self {
            Token::VOID_KW => Type::Void,
            Token::BOOL_KW => Type::Bool,
            Token::INT_KW => Type::Int,
            Token::FLOAT_KW => Type::Float,
            Token::VEC2_KW => Type::Vec2,
            Token::VEC3_KW => Type::Vec3,
            Token::VEC4_KW => Type::Vec4,
            Token::MAT2_KW => Type::Mat2,
            Token::MAT3_KW => Type::Mat3,
            Token::MAT4_KW => Type::Mat4,
            Token::SAMPLER_KW => Type::Sampler,
            _ => return None,
        })
    }

    /// Human-readable token description for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Token::IDENT(name) => format!("identifier `{}`", name),
            Token::INT_NUMBER(text) | Token::FLOAT_NUMBER(text) => format!("number `{}`", text),
            Token::LEXER_ERROR => "invalid character".to_string(),
            other => format!("`{}`", token_text(other)),
        }
    }
}

fn token_text(token: &Token) -> &'static str {
    match token {
        Token::L_PAREN => "(",
        Token::R_PAREN => ")",
        Token::L_CURLY => "{",
        Token::R_CURLY => "}",
        Token::L_BRACK => "[",
        Token::R_BRACK => "]",
        Token::COMMA => ",",
        Token::DOT => ".",
        Token::SEMICOLON => ";",
        Token::QUESTION => "?",
        Token::COLON => ":",
        Token::PLUSPLUS => "++",
        Token::MINUSMINUS => "--",
        Token::PLUS => "+",
        Token::MINUS => "-",
        Token::STAR => "*",
        Token::SLASH => "/",
        Token::PERCENT => "%",
        Token::BANG => "!",
        Token::L_ANGLE => "<",
        Token::R_ANGLE => ">",
        Token::LTEQ => "<=",
        Token::GTEQ => ">=",
        Token::EQ2 => "==",
        Token::NEQ => "!=",
        Token::AMP2 => "&&",
        Token::PIPE2 => "||",
        Token::EQ => "=",
        Token::PLUSEQ => "+=",
        Token::MINUSEQ => "-=",
        Token::STAREQ => "*=",
        Token::SLASHEQ => "/=",
        Token::KERNEL_KW => "kernel",
        Token::CONST_KW => "const",
        Token::STATIC_KW => "static",
        Token::IN_KW => "in",
        Token::OUT_KW => "out",
        Token::INOUT_KW => "inout",
        Token::IF_KW => "if",
        Token::ELSE_KW => "else",
        Token::FOR_KW => "for",
        Token::WHILE_KW => "while",
        Token::DO_KW => "do",
        Token::RETURN_KW => "return",
        Token::BREAK_KW => "break",
        Token::CONTINUE_KW => "continue",
        Token::TRUE_KW => "true",
        Token::FALSE_KW => "false",
        Token::VOID_KW => "void",
        Token::BOOL_KW => "bool",
        Token::INT_KW => "int",
        Token::FLOAT_KW => "float",
        Token::VEC2_KW => "vec2",
        Token::VEC3_KW => "vec3",
        Token::VEC4_KW => "vec4",
        Token::MAT2_KW => "mat2",
        Token::MAT3_KW => "mat3",
        Token::MAT4_KW => "mat4",
        Token::SAMPLER_KW => "sampler",
        _ => "?",
    }
}

/// Maps byte offsets to 1-based line/column pairs.
pub struct LineMap {
    lines: Vec<usize>,
}

impl LineMap {
    pub fn new(source: &str) -> LineMap {
        let mut lines = vec![0];
        for (i, c) in source.char_indices() {
            if c == '\n' {
                lines.push(i + 1);
            }
        }
        LineMap { lines }
    }

    pub fn line_col(&self, offset: usize) -> (u32, u32) {
        let line = self.lines.binary_search(&offset).unwrap_or_else(|i| i - 1);
        let col = offset - self.lines[line] + 1;
        (line as u32 + 1, col as u32)
    }
}

/// Tokenise a source string, keeping spans.
pub fn lex(source: &str) -> Vec<(Token<'_>, logos::Span)> {
    Token::lexer(source).spanned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_kernel_header() {
        let tokens = lex("kernel vec4 f(float x) { return vec4(x); }");
        assert_eq!(tokens[0].0, Token::KERNEL_KW);
        assert_eq!(tokens[1].0, Token::VEC4_KW);
        assert_eq!(tokens[2].0, Token::IDENT("f"));
    }

    #[test]
    fn skips_comments() {
        let tokens = lex("1 // comment\n/* block */ 2.5");
        assert_eq!(tokens.len(), 2);
        assert!(matches!(tokens[0].0, Token::INT_NUMBER("1")));
        assert!(matches!(tokens[1].0, Token::FLOAT_NUMBER("2.5")));
    }

    #[test]
    fn line_map_positions() {
        let map = LineMap::new("ab\ncd\n");
        assert_eq!(map.line_col(0), (1, 1));
        assert_eq!(map.line_col(4), (2, 2));
    }
}
