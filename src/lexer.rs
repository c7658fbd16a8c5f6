use super::error::{Error, ErrorKind};
use super::token::Token;
use combine::error::{ParseError, StreamError};
use combine::parser::char::{alpha_num, digit, letter, newline, space};
use combine::parser::choice::or;
use combine::parser::repeat::take_until;
use combine::parser::{EasyParser, Parser};
use combine::stream::{position, Stream, StreamErrorFor};
use combine::{choice, eof, many, many1, parser, satisfy, skip_many, token};

fn number<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(choice((digit(), token('.'))))
        .and_then(|ns: String| ns.parse::<f64>().map_err(StreamErrorFor::<Input>::other))
        .map(Token::Number)
}

fn ident<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (letter(), many(alpha_num())).map(|(head, tail): (char, String)| {
        let mut s = String::with_capacity(tail.len() + 1);
        s.push(head);
        s.push_str(&tail);
        match s.as_ref() {
            "def" => Token::Def,
            "extern" => Token::Extern,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            _ => Token::Ident(s),
        }
    })
}

fn kwd<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    satisfy(|c: char| !c.is_whitespace()).map(Token::Kwd)
}

fn comment<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        token('#'),
        take_until::<Vec<_>, _, _>(or(newline().map(|_| ()), eof())),
    )
        .map(|_| ())
}

fn lex_<Input>() -> impl Parser<Input, Output = Option<Token>>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip_many(or(space().map(|_| ()), comment())).with(choice((
        number().map(Some),
        ident().map(Some),
        kwd().map(Some),
        eof().map(|_| None),
    )))
}

parser! {
    pub(crate) fn lex[Input]()(Input) -> Option<Token>
        where [Input: Stream<Token=char>]
    {
        lex_()
    }
}

/// Splits `src` into tokens. An empty vector means the input held nothing
/// but whitespace and comments.
pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, Error> {
    let mut buf = position::Stream::new(src);
    let mut tokens = Vec::new();
    loop {
        match lex().easy_parse(buf) {
            Ok((Some(token), rest)) => {
                buf = rest;
                tokens.push(token);
            }
            Ok((None, _)) => return Ok(tokens),
            Err(e) => return Err(Error::from(ErrorKind::Lex(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::token::Token::*;
    use super::*;

    #[test]
    fn test_number() {
        assert_eq!(number().easy_parse("1.0").map(|x| x.0), Ok(Number(1.0)));
        assert_eq!(number().easy_parse(".5").map(|x| x.0), Ok(Number(0.5)));
        assert!(number().easy_parse("1.2.3").is_err());
    }

    #[test]
    fn test_ident() {
        assert_eq!(
            ident().easy_parse("test").map(|x| x.0),
            Ok(Ident("test".to_owned()))
        );
        assert_eq!(
            ident().easy_parse("x1").map(|x| x.0),
            Ok(Ident("x1".to_owned()))
        );

        assert_eq!(ident().easy_parse("def").map(|x| x.0), Ok(Def));
        assert_eq!(ident().easy_parse("extern").map(|x| x.0), Ok(Extern));
        assert_eq!(ident().easy_parse("then").map(|x| x.0), Ok(Then));
    }

    #[test]
    fn test_comment() {
        assert_eq!(
            comment().easy_parse("# x*x, then halve it").map(|x| x.0),
            Ok(())
        );
        assert_eq!(
            comment().easy_parse("# sq(x)\ndef").map(|x| x.1),
            Ok("\ndef")
        );
    }

    #[test]
    fn test_lex() {
        assert_eq!(
            lex()
                .easy_parse(
                    r#"# squares its argument
def sq(x) x*x
"#
                )
                .map(|x| x.0),
            Ok(Some(Def))
        );
        assert_eq!(lex().easy_parse("\textern").map(|x| x.0), Ok(Some(Extern)));
        assert_eq!(lex().easy_parse("  # only a comment").map(|x| x.0), Ok(None));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("def add(a b) a+b; # sum").unwrap(),
            vec![
                Def,
                Ident("add".to_owned()),
                Kwd('('),
                Ident("a".to_owned()),
                Ident("b".to_owned()),
                Kwd(')'),
                Ident("a".to_owned()),
                Kwd('+'),
                Ident("b".to_owned()),
                Kwd(';'),
            ]
        );

        assert_eq!(
            tokenize("if x<3 then 1 else 2").unwrap(),
            vec![
                If,
                Ident("x".to_owned()),
                Kwd('<'),
                Number(3.0),
                Then,
                Number(1.0),
                Else,
                Number(2.0),
            ]
        );
    }

    #[test]
    fn test_tokenize_empty_and_bad_number() {
        assert_eq!(tokenize("   \n# nothing here").unwrap(), vec![]);

        let err = tokenize("1 + 1.2.3").unwrap_err();
        match err.kind() {
            ErrorKind::Lex(_) => {}
            k => panic!("unexpected error kind {:?}", k),
        }
    }
}
