use super::ast::{Expr, Function, Prototype};
use super::error::{Error, ErrorKind};
use super::token::Token;
use combine::easy;
use combine::error::{ParseError, StreamError};
use combine::parser::EasyParser;
use combine::parser::Parser;
use combine::stream::{position, Stream, StreamErrorFor};
use combine::{between, choice, many, optional, parser, satisfy_map, sep_by, token};
use std::iter::Peekable;

/// Name given to the function wrapping a top-level expression. Identifiers
/// cannot contain `_`, so user code never collides with it.
pub(crate) const ANON_EXPR: &str = "__anon_expr";

/// Binding power of a binary operator, or -1 for anything that is not one.
pub(crate) fn precedence(op: char) -> i32 {
    match op {
        '<' => 10,
        '+' | '-' => 20,
        '*' | '/' => 40,
        _ => -1,
    }
}

fn ident<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    satisfy_map(|t| match t {
        Token::Ident(id) => Some(id),
        _ => None,
    })
    .expected("identifier")
}

fn binop<Input>() -> impl Parser<Input, Output = char>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    satisfy_map(|t| match t {
        Token::Kwd(c) if c.is_ascii() && precedence(c) > 0 => Some(c),
        _ => None,
    })
}

fn args<Input>() -> impl Parser<Input, Output = Vec<Expr>>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    sep_by(expr(), token(Token::Kwd(',')))
}

fn identifier_expr<Input>() -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        ident(),
        optional(between(
            token(Token::Kwd('(')),
            token(Token::Kwd(')')).expected("')' or ',' in argument list"),
            args(),
        )),
    )
        .map(|(id, call)| match call {
            Some(aa) => Expr::Call(id, aa),
            None => Expr::Variable(id),
        })
}

fn parse_if<Input>() -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    use super::token::Token::*;

    (
        token(If),
        expr(),
        token(Then).expected("then"),
        expr(),
        token(Else).expected("else"),
        expr(),
    )
        .map(|(_, c, _, t, _, e)| Expr::If(Box::new(c), Box::new(t), Box::new(e)))
}

fn primary_<Input>() -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    use super::token::Token::*;
    let number = satisfy_map(|c| match c {
        Number(n) => Some(Expr::Number(n)),
        _ => None,
    });

    let paren = between(token(Kwd('(')), token(Kwd(')')).expected("')'"), expr());

    choice((number, identifier_expr(), paren, parse_if())).expected("expression")
}

parser! {
    fn primary[Input]()(Input) -> Expr
        where [Input: Stream<Token=Token>]
    {
        primary_()
    }
}

/// Folds a flat `primary (op primary)*` sequence into a tree by precedence
/// climbing. Operators of equal precedence associate to the left because the
/// recursive call only happens for a strictly tighter operator.
fn binop_rhs<I>(min_prec: i32, mut lhs: Expr, rest: &mut Peekable<I>) -> Expr
where
    I: Iterator<Item = (char, Expr)>,
{
    while let Some((op, mut rhs)) = rest.next_if(|(op, _)| precedence(*op) >= min_prec) {
        let prec = precedence(op);
        let next_prec = rest.peek().map_or(-1, |(next, _)| precedence(*next));
        if prec < next_prec {
            rhs = binop_rhs(prec + 1, rhs, rest);
        }
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    lhs
}

fn expr<Input>() -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (primary(), many::<Vec<_>, _, _>((binop(), primary())))
        .map(|(lhs, rest)| binop_rhs(0, lhs, &mut rest.into_iter().peekable()))
}

fn prototype<Input>() -> impl Parser<Input, Output = Prototype>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    use super::token::Token::*;

    let params = many::<Vec<_>, _, _>(ident());

    (
        ident().expected("function name in prototype"),
        between(
            token(Kwd('(')).expected("'(' in prototype"),
            token(Kwd(')')).expected("')' in prototype"),
            params,
        ),
    )
        .and_then(|(name, params)| {
            for (i, p) in params.iter().enumerate() {
                if params[..i].contains(p) {
                    return Err(StreamErrorFor::<Input>::message_format(format!(
                        "duplicate parameter '{}' in prototype '{}'",
                        p, name
                    )));
                }
            }
            Ok(Prototype::new(name, params))
        })
}

pub(crate) fn definition<Input>() -> impl Parser<Input, Output = Function>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (token(Token::Def), prototype(), expr()).map(|(_, p, e)| Function::new(p, e))
}

pub(crate) fn toplevel<Input>() -> impl Parser<Input, Output = Function>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    expr().map(|e| Function::new(Prototype::new(ANON_EXPR, vec![]), e))
}

pub(crate) fn extern_parser<Input>() -> impl Parser<Input, Output = Prototype>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (token(Token::Extern), prototype()).map(|(_, p)| p)
}

type TokenStream<'a> = position::Stream<&'a [Token], position::IndexPositioner>;

fn syntax_error(errors: easy::Errors<Token, &[Token], usize>) -> Error {
    if errors.errors.contains(&easy::Error::end_of_input()) {
        return Error::from(ErrorKind::Incomplete);
    }

    fn info(i: &easy::Info<Token, &[Token]>) -> String {
        match i {
            easy::Info::Token(t) => format!("`{}`", t),
            easy::Info::Range(r) => r
                .iter()
                .map(|t| format!("`{}`", t))
                .collect::<Vec<_>>()
                .join(" "),
            easy::Info::Owned(s) => s.clone(),
            easy::Info::Static(s) => (*s).to_owned(),
        }
    }

    let mut unexpected = Vec::new();
    let mut expected = Vec::new();
    let mut messages = Vec::new();
    for e in &errors.errors {
        match e {
            easy::Error::Unexpected(i) => unexpected.push(info(i)),
            easy::Error::Expected(i) => expected.push(info(i)),
            easy::Error::Message(i) => messages.push(info(i)),
            easy::Error::Other(err) => messages.push(err.to_string()),
        }
    }

    let mut message = format!("at token {}:", errors.position + 1);
    if !unexpected.is_empty() {
        message.push_str(&format!(" unexpected {}", unexpected.join(", ")));
    }
    if !expected.is_empty() {
        message.push_str(&format!(" when expecting {}", expected.join(" or ")));
    }
    if !messages.is_empty() {
        message.push_str(&format!(" ({})", messages.join("; ")));
    }
    Error::from(ErrorKind::Syntax(message))
}

fn run<'a, P, O>(mut p: P, tokens: &'a [Token]) -> Result<(O, &'a [Token]), Error>
where
    P: Parser<easy::Stream<TokenStream<'a>>, Output = O>,
{
    p.easy_parse(position::Stream::new(tokens))
        .map(|(o, rest)| (o, rest.input))
        .map_err(syntax_error)
}

pub(crate) fn parse_definition(tokens: &[Token]) -> Result<(Function, &[Token]), Error> {
    run(definition(), tokens)
}

pub(crate) fn parse_extern(tokens: &[Token]) -> Result<(Prototype, &[Token]), Error> {
    run(extern_parser(), tokens)
}

pub(crate) fn parse_top_level_expr(tokens: &[Token]) -> Result<(Function, &[Token]), Error> {
    run(toplevel(), tokens)
}
